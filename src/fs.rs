use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use filetime::{FileTime, set_file_times};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use serde_json::{json, Value};
use similar::TextDiff;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::SystemTime;
use tokio::fs;

const TREE_MAX_DEPTH: usize = 10;
const SEARCH_MAX_DEPTH: usize = 20;

pub async fn move_path(from: &Path, to: &Path) -> Result<()> {
	if fs::metadata(to).await.is_ok() {
		return Err(anyhow!("target exists"));
	}
	match fs::rename(from, to).await {
		Ok(_) => return Ok(()),
		Err(err) => {
			if !is_cross_device(&err) {
				return Err(err.into());
			}
		}
	}
	let meta = fs::metadata(from).await?;
	if meta.is_dir() {
		copy_dir_recursive(from.to_path_buf(), to.to_path_buf()).await?;
		fs::remove_dir_all(from).await?;
	}
	else {
		copy_file_with_meta(from, to).await?;
		fs::remove_file(from).await?;
	}
	Ok(())
}

pub async fn copy_path(from: &Path, to: &Path) -> Result<()> {
	if fs::metadata(to).await.is_ok() {
		return Err(anyhow!("target exists"));
	}
	let meta = fs::metadata(from).await?;
	if meta.is_dir() {
		copy_dir_recursive(from.to_path_buf(), to.to_path_buf()).await?;
	}
	else {
		copy_file_with_meta(from, to).await?;
	}
	Ok(())
}

pub async fn delete_path(path: &Path) -> Result<()> {
	let meta = fs::metadata(path).await?;
	if meta.is_dir() {
		fs::remove_dir_all(path).await?;
	}
	else {
		fs::remove_file(path).await?;
	}
	Ok(())
}

async fn copy_file_with_meta(from: &Path, to: &Path) -> Result<()> {
	fs::copy(from, to).await?;
	let meta = fs::metadata(from).await?;
	fs::set_permissions(to, meta.permissions()).await?;
	let atime = FileTime::from_last_access_time(&meta);
	let mtime = FileTime::from_last_modification_time(&meta);
	set_file_times(to, atime, mtime)?;
	Ok(())
}

fn copy_dir_recursive(from: PathBuf, to: PathBuf) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
	Box::pin(
		async move {
			fs::create_dir_all(&to).await?;
			let mut entries = fs::read_dir(&from).await?;
			while let Some(entry) = entries.next_entry().await? {
				let src = entry.path();
				let dst = to.join(entry.file_name());
				let meta = fs::metadata(&src).await?;
				if meta.is_dir() {
					copy_dir_recursive(src, dst).await?;
				}
				else {
					copy_file_with_meta(&src, &dst).await?;
				}
			}
			let meta = fs::metadata(&from).await?;
			fs::set_permissions(&to, meta.permissions()).await?;
			let atime = FileTime::from_last_access_time(&meta);
			let mtime = FileTime::from_last_modification_time(&meta);
			set_file_times(&to, atime, mtime)?;
			Ok(())
		}
	)
}

fn is_cross_device(err: &std::io::Error) -> bool {
	err.raw_os_error() == Some(libc::EXDEV)
}

pub struct EditSpec {
	pub old_text: String,
	pub new_text: String,
}

pub fn apply_edits(content: &str, edits: &[EditSpec]) -> Result<String> {
	let mut updated = content.to_string();
	for (index, edit) in edits.iter().enumerate() {
		if edit.old_text.is_empty() {
			return Err(anyhow!("old_text is empty at index {}", index));
		}
		if !updated.contains(&edit.old_text) {
			return Err(anyhow!("old text not found at index {}", index));
		}
		updated = updated.replacen(&edit.old_text, &edit.new_text, 1);
	}
	Ok(updated)
}

pub fn make_diff(existing: &str, updated: &str, label: &str) -> String {
	let diff = TextDiff::from_lines(existing, updated);
	diff.unified_diff()
		.context_radius(3)
		.header(&format!("a/{}", label), &format!("b/{}", label))
		.to_string()
}

pub async fn list_directory(path: &Path) -> Result<Value> {
	let mut collected: Vec<(String, bool)> = Vec::new();
	let mut entries = fs::read_dir(path).await?;
	while let Some(entry) = entries.next_entry().await? {
		let name = entry.file_name().to_string_lossy().to_string();
		let is_dir = entry.file_type().await.map(|kind| kind.is_dir()).unwrap_or(false);
		collected.push((name, is_dir));
	}
	collected.sort();
	let entries: Vec<Value> = collected.into_iter()
		.map(
			|(name, is_dir)| {
				json!({
					"name": name,
					"type": if is_dir {
						"directory"
					}
					else {
						"file"
					}
				})
			})
		.collect();
	let count = entries.len();
	Ok(json!({
		"entries": entries,
		"count": count
	}))
}

pub async fn directory_tree(path: &Path) -> Result<Value> {
	let meta = fs::metadata(path).await?;
	let name = entry_name(path);
	if !meta.is_dir() {
		return Ok(json!({
			"name": name,
			"type": "file"
		}));
	}
	build_tree(path.to_path_buf(), name, 0).await
}

fn build_tree(
	path: PathBuf,
	name: String,
	depth: usize) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> {
	Box::pin(
		async move {
			let mut children = Vec::new();
			if depth >= TREE_MAX_DEPTH {
				return Ok(json!({
					"name": name,
					"type": "directory",
					"children": children,
					"truncated": true
				}));
			}
			let mut entries = fs::read_dir(&path).await?;
			let mut collected: Vec<(String, PathBuf, bool)> = Vec::new();
			while let Some(entry) = entries.next_entry().await? {
				let entry_path = entry.path();
				let entry_name = entry.file_name().to_string_lossy().to_string();
				let is_dir = entry.file_type().await.map(|kind| kind.is_dir()).unwrap_or(false);
				collected.push((entry_name, entry_path, is_dir));
			}
			collected.sort();
			for (entry_name, entry_path, is_dir) in collected {
				if is_dir {
					children.push(build_tree(entry_path, entry_name, depth + 1).await?);
				}
				else {
					children.push(json!({
						"name": entry_name,
						"type": "file"
					}));
				}
			}
			Ok(json!({
				"name": name,
				"type": "directory",
				"children": children
			}))
		}
	)
}

pub async fn search_files(root: &Path, pattern: &str, exclude: &[String]) -> Result<Value> {
	let matcher = GlobBuilder::new(pattern)
		.case_insensitive(true)
		.build()
		.map_err(|err| anyhow!("invalid pattern: {}", err))?
		.compile_matcher();
	let exclude_set = build_exclude_set(exclude)?;
	let mut matches = Vec::new();
	let walker = WalkBuilder::new(root)
		.standard_filters(false)
		.max_depth(Some(SEARCH_MAX_DEPTH))
		.build();
	for entry in walker {
		let entry = match entry {
			Ok(entry) => entry,
			Err(_) => continue,
		};
		let path = entry.path();
		if path == root {
			continue;
		}
		let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
			continue;
		};
		if let Some(set) = &exclude_set {
			let rel = relative_display(root, path);
			if set.is_match(name) || set.is_match(&rel) {
				continue;
			}
		}
		if !matcher.is_match(name) {
			continue;
		}
		let kind = if is_dir_entry(&entry) {
			"directory"
		}
		else {
			"file"
		};
		matches.push(json!({
			"path": path.to_string_lossy(),
			"type": kind
		}));
	}
	let count = matches.len();
	Ok(json!({
		"matches": matches,
		"pattern": pattern,
		"count": count
	}))
}

pub async fn file_info(path: &Path) -> Result<Value> {
	let meta = fs::metadata(path).await?;
	let mut obj = serde_json::Map::new();
	obj.insert("path".to_string(), Value::String(path.to_string_lossy().to_string()));
	obj.insert("name".to_string(), Value::String(entry_name(path)));
	obj.insert(
		"type".to_string(),
		Value::String(
			if meta.is_dir() {
				"directory".to_string()
			}
			else {
				"file".to_string()
			}
		)
	);
	obj.insert("size".to_string(), Value::Number(meta.len().into()));
	if let Ok(created) = meta.created() {
		obj.insert("created".to_string(), Value::String(format_timestamp(created)));
	}
	if let Ok(modified) = meta.modified() {
		obj.insert("modified".to_string(), Value::String(format_timestamp(modified)));
	}
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		obj.insert(
			"permissions".to_string(),
			Value::String(format!("{:o}", meta.permissions().mode() & 0o777))
		);
	}
	Ok(Value::Object(obj))
}

fn format_timestamp(time: SystemTime) -> String {
	DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn entry_name(path: &Path) -> String {
	path.file_name()
		.map(|name| name.to_string_lossy().to_string())
		.unwrap_or_else(|| path.to_string_lossy().to_string())
}

fn build_exclude_set(patterns: &[String]) -> Result<Option<GlobSet>> {
	if patterns.is_empty() {
		return Ok(None);
	}
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		let glob = GlobBuilder::new(pattern)
			.case_insensitive(true)
			.build()
			.map_err(|err| anyhow!("invalid exclude glob: {}", err))?;
		builder.add(glob);
	}
	Ok(Some(builder.build().map_err(|err| anyhow!("invalid exclude set: {}", err))?))
}

fn is_dir_entry(entry: &ignore::DirEntry) -> bool {
	let ftype = entry.file_type();
	if ftype.map(|kind| kind.is_dir()).unwrap_or(false) {
		return true;
	}
	if ftype.map(|kind| kind.is_symlink()).unwrap_or(false) {
		if let Ok(meta) = std::fs::metadata(entry.path()) {
			return meta.is_dir();
		}
	}
	false
}

fn relative_display(root: &Path, path: &Path) -> String {
	if let Ok(rel) = path.strip_prefix(root) {
		return rel.to_string_lossy().to_string();
	}
	path.to_string_lossy().to_string()
}

pub fn normalize_path(path: &Path) -> PathBuf {
	use std::path::Component;
	let mut stack: Vec<std::ffi::OsString> = Vec::new();
	let mut prefix: Option<std::ffi::OsString> = None;
	let mut absolute = false;
	for component in path.components() {
		match component {
			Component::Prefix(prefix_component) => {
				prefix = Some(prefix_component.as_os_str().to_os_string());
			}
			Component::RootDir => {
				absolute = true;
				stack.clear();
			}
			Component::CurDir => {}
			Component::ParentDir => {
				if !stack.is_empty() {
					stack.pop();
				}
				else if !absolute {
					stack.push(std::ffi::OsString::from(".."));
				}
			}
			Component::Normal(part) => stack.push(part.to_os_string()),
		}
	}
	let mut out = PathBuf::new();
	if let Some(prefix) = prefix {
		out.push(prefix);
	}
	if absolute {
		out.push(Path::new("/"));
	}
	for part in stack {
		out.push(part);
	}
	out
}
