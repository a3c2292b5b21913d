use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

struct RpcClient {
	child: Child,
	stdin: ChildStdin,
	stdout: BufReader<ChildStdout>,
	next_id: u64,
}

impl RpcClient {
	fn spawn(readwrite: &[&Path], readonly: &[&Path]) -> Self {
		let bin = env!("CARGO_BIN_EXE_fsgate");
		let mut cmd = Command::new(bin);
		cmd.arg("--otel-enabled").arg("false");
		if !readwrite.is_empty() {
			cmd.arg("--readwrite");
			for dir in readwrite {
				cmd.arg(dir);
			}
		}
		if !readonly.is_empty() {
			cmd.arg("--readonly");
			for dir in readonly {
				cmd.arg(dir);
			}
		}
		let mut child = cmd.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.spawn()
			.expect("spawn fsgate");
		let stdin = child.stdin
			.take()
			.expect("stdin");
		let stdout = child.stdout
			.take()
			.expect("stdout");
		Self {
			child,
			stdin,
			stdout: BufReader::new(stdout),
			next_id: 1
		}
	}
	fn send(&mut self, method: &str, params: Value) -> Value {
		let id = self.next_id;
		self.next_id += 1;
		let req = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params
		});
		let line = serde_json::to_string(&req).expect("serialize request");
		writeln!(self.stdin, "{}", line).expect("write request");
		self.stdin
			.flush()
			.expect("flush request");
		let mut resp_line = String::new();
		loop {
			resp_line.clear();
			let bytes = self.stdout
				.read_line(&mut resp_line)
				.expect("read response");
			if bytes == 0 {
				panic!("fsgate exited unexpectedly");
			}
			let trimmed = resp_line.trim();
			if trimmed.is_empty() {
				continue;
			}
			let parsed: Value = match serde_json::from_str(trimmed) {
				Ok(value) => value,
				Err(_) => continue,
			};
			if parsed.get("id").and_then(Value::as_u64) == Some(id) {
				return parsed;
			}
		}
	}
	fn call(&mut self, tool: &str, arguments: Value) -> Value {
		self.send("tools/call", json!({
			"name": tool,
			"arguments": arguments
		}))
	}
}

impl Drop for RpcClient {
	fn drop(&mut self) {
		let _ = self.child.kill();
	}
}

fn write_text(path: &Path, contents: &str) {
	std::fs::create_dir_all(path.parent().unwrap()).expect("create parent");
	std::fs::write(path, contents).expect("write file");
}

fn structured(resp: &Value) -> &Value {
	resp.get("result")
		.and_then(|result| result.get("structuredContent"))
		.expect("structuredContent")
}

fn is_error(resp: &Value) -> bool {
	resp.get("result")
		.and_then(|result| result.get("isError"))
		.and_then(Value::as_bool)
		.unwrap_or(false)
}

fn denial_code<'a>(resp: &'a Value) -> &'a str {
	structured(resp).get("code")
		.and_then(Value::as_str)
		.expect("code")
}

#[test]
fn write_creates_file_and_read_returns_it() {
	let root = tempfile::tempdir().expect("tempdir");
	let target = root.path().join("notes.txt");
	let mut client = RpcClient::spawn(&[root.path()], &[]);
	let resp = client.call("write_file", json!({
		"path": target.to_string_lossy(),
		"content": "hello sandbox"
	}));
	assert!(!is_error(&resp));
	assert_eq!(
		structured(&resp).get("created").and_then(Value::as_bool),
		Some(true)
	);
	let resp = client.call("read_file", json!({
		"path": target.to_string_lossy()
	}));
	assert!(!is_error(&resp));
	let content = structured(&resp).get("content")
		.and_then(Value::as_str)
		.expect("content");
	assert_eq!(content, "hello sandbox");
}

#[test]
fn write_into_readonly_root_is_denied() {
	let root = tempfile::tempdir().expect("tempdir");
	let target = root.path().join("frozen.txt");
	write_text(&target, "original");
	let mut client = RpcClient::spawn(&[], &[root.path()]);
	let resp = client.call("write_file", json!({
		"path": target.to_string_lossy(),
		"content": "mutated"
	}));
	assert!(is_error(&resp));
	assert_eq!(denial_code(&resp), "READ_ONLY_VIOLATION");
	assert!(structured(&resp).get("denied_path").and_then(Value::as_str).is_some());
	assert!(structured(&resp).get("allowed_roots").and_then(Value::as_str).is_some());
	let current = std::fs::read_to_string(&target).expect("read file");
	assert_eq!(current, "original");
}

#[test]
fn read_from_readonly_root_is_allowed() {
	let root = tempfile::tempdir().expect("tempdir");
	let target = root.path().join("reference.txt");
	write_text(&target, "reference data");
	let mut client = RpcClient::spawn(&[], &[root.path()]);
	let resp = client.call("read_file", json!({
		"path": target.to_string_lossy()
	}));
	assert!(!is_error(&resp));
	let content = structured(&resp).get("content")
		.and_then(Value::as_str)
		.expect("content");
	assert_eq!(content, "reference data");
}

#[test]
fn read_outside_every_root_is_denied() {
	let base = tempfile::tempdir().expect("tempdir");
	let root = base.path().join("root");
	let external = base.path().join("external");
	std::fs::create_dir_all(&root).expect("root");
	write_text(&external.join("data.txt"), "outside");
	let mut client = RpcClient::spawn(&[&root], &[]);
	let resp = client.call("read_file", json!({
		"path": external.join("data.txt").to_string_lossy()
	}));
	assert!(is_error(&resp));
	assert_eq!(denial_code(&resp), "OUTSIDE_SANDBOX");
}

#[test]
fn sibling_directory_with_matching_prefix_is_outside() {
	let base = tempfile::tempdir().expect("tempdir");
	let data = base.path().join("data");
	let sibling = base.path().join("data-secret");
	std::fs::create_dir_all(&data).expect("data");
	write_text(&sibling.join("key.txt"), "secret");
	let mut client = RpcClient::spawn(&[&data], &[]);
	let resp = client.call("read_file", json!({
		"path": sibling.join("key.txt").to_string_lossy()
	}));
	assert!(is_error(&resp));
	assert_eq!(denial_code(&resp), "OUTSIDE_SANDBOX");
}

#[test]
fn nested_readonly_root_takes_precedence() {
	let base = tempfile::tempdir().expect("tempdir");
	let proj = base.path().join("proj");
	let vendor = proj.join("vendor");
	std::fs::create_dir_all(&vendor).expect("dirs");
	write_text(&vendor.join("lib.js"), "lib");
	let mut client = RpcClient::spawn(&[&proj], &[&vendor]);
	let resp = client.call("write_file", json!({
		"path": proj.join("app.js").to_string_lossy(),
		"content": "app"
	}));
	assert!(!is_error(&resp));
	let resp = client.call("write_file", json!({
		"path": vendor.join("lib.js").to_string_lossy(),
		"content": "patched"
	}));
	assert!(is_error(&resp));
	assert_eq!(denial_code(&resp), "READ_ONLY_VIOLATION");
	let current = std::fs::read_to_string(vendor.join("lib.js")).expect("read file");
	assert_eq!(current, "lib");
}

#[test]
fn copy_from_readonly_into_readwrite_is_allowed() {
	let base = tempfile::tempdir().expect("tempdir");
	let archive = base.path().join("archive");
	let work = base.path().join("work");
	std::fs::create_dir_all(&work).expect("work");
	write_text(&archive.join("backup.txt"), "backup");
	let mut client = RpcClient::spawn(&[&work], &[&archive]);
	let resp = client.call("copy_file", json!({
		"source": archive.join("backup.txt").to_string_lossy(),
		"destination": work.join("restored.txt").to_string_lossy()
	}));
	assert!(!is_error(&resp));
	let current = std::fs::read_to_string(work.join("restored.txt")).expect("read file");
	assert_eq!(current, "backup");
}

#[test]
fn copy_into_readonly_root_is_denied() {
	let base = tempfile::tempdir().expect("tempdir");
	let archive = base.path().join("archive");
	let work = base.path().join("work");
	std::fs::create_dir_all(&archive).expect("archive");
	write_text(&work.join("draft.txt"), "draft");
	let mut client = RpcClient::spawn(&[&work], &[&archive]);
	let resp = client.call("copy_file", json!({
		"source": work.join("draft.txt").to_string_lossy(),
		"destination": archive.join("draft.txt").to_string_lossy()
	}));
	assert!(is_error(&resp));
	assert_eq!(denial_code(&resp), "READ_ONLY_VIOLATION");
	assert!(!archive.join("draft.txt").exists());
}

#[test]
fn move_with_readonly_source_is_denied() {
	let base = tempfile::tempdir().expect("tempdir");
	let archive = base.path().join("archive");
	let work = base.path().join("work");
	std::fs::create_dir_all(&work).expect("work");
	write_text(&archive.join("keep.txt"), "keep");
	let mut client = RpcClient::spawn(&[&work], &[&archive]);
	let resp = client.call("move_file", json!({
		"source": archive.join("keep.txt").to_string_lossy(),
		"destination": work.join("keep.txt").to_string_lossy()
	}));
	assert!(is_error(&resp));
	assert_eq!(denial_code(&resp), "READ_ONLY_VIOLATION");
	assert!(archive.join("keep.txt").exists());
}

#[test]
fn move_with_readonly_destination_is_denied() {
	let base = tempfile::tempdir().expect("tempdir");
	let archive = base.path().join("archive");
	let work = base.path().join("work");
	std::fs::create_dir_all(&archive).expect("archive");
	write_text(&work.join("out.txt"), "out");
	let mut client = RpcClient::spawn(&[&work], &[&archive]);
	let resp = client.call("move_file", json!({
		"source": work.join("out.txt").to_string_lossy(),
		"destination": archive.join("out.txt").to_string_lossy()
	}));
	assert!(is_error(&resp));
	assert_eq!(denial_code(&resp), "READ_ONLY_VIOLATION");
	assert!(work.join("out.txt").exists());
}

#[test]
fn move_directory_and_delete_it() {
	let root = tempfile::tempdir().expect("tempdir");
	let nested = root.path().join("src").join("nested");
	write_text(&nested.join("file.txt"), "data");
	let mut client = RpcClient::spawn(&[root.path()], &[]);
	let resp = client.call("move_file", json!({
		"source": root.path().join("src").to_string_lossy(),
		"destination": root.path().join("dst").to_string_lossy()
	}));
	assert!(!is_error(&resp));
	assert!(root.path().join("dst/nested/file.txt").exists());
	let resp = client.call("delete_file", json!({
		"path": root.path().join("dst").to_string_lossy()
	}));
	assert!(!is_error(&resp));
	assert!(!root.path().join("dst").exists());
}

#[test]
fn move_onto_existing_target_errors() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("from.txt"), "from");
	write_text(&root.path().join("to.txt"), "to");
	let mut client = RpcClient::spawn(&[root.path()], &[]);
	let resp = client.call("move_file", json!({
		"source": root.path().join("from.txt").to_string_lossy(),
		"destination": root.path().join("to.txt").to_string_lossy()
	}));
	assert!(is_error(&resp));
	assert_eq!(denial_code(&resp), "TARGET_EXISTS");
}

#[cfg(unix)]
#[test]
fn symlink_escaping_the_sandbox_is_denied() {
	let base = tempfile::tempdir().expect("tempdir");
	let root = base.path().join("root");
	let external = base.path().join("external");
	std::fs::create_dir_all(&root).expect("root");
	write_text(&external.join("secret.txt"), "secret");
	std::os::unix::fs::symlink(external.join("secret.txt"), root.join("escape"))
		.expect("symlink");
	let mut client = RpcClient::spawn(&[&root], &[]);
	let resp = client.call("read_file", json!({
		"path": root.join("escape").to_string_lossy()
	}));
	assert!(is_error(&resp));
	assert_eq!(denial_code(&resp), "OUTSIDE_SANDBOX");
}

#[test]
fn write_under_missing_parent_is_invalid() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(&[root.path()], &[]);
	let resp = client.call("write_file", json!({
		"path": root.path().join("missing").join("file.txt").to_string_lossy(),
		"content": "x"
	}));
	assert!(is_error(&resp));
	assert_eq!(denial_code(&resp), "INVALID_PATH");
}

#[test]
fn create_directory_then_tree_reports_structure() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(&[root.path()], &[]);
	let resp = client.call("create_directory", json!({
		"path": root.path().join("a").to_string_lossy()
	}));
	assert!(!is_error(&resp));
	write_text(&root.path().join("a").join("inner.txt"), "inner");
	let resp = client.call("directory_tree", json!({
		"path": root.path().to_string_lossy()
	}));
	assert!(!is_error(&resp));
	let tree = structured(&resp).get("tree").expect("tree");
	let children = tree.get("children")
		.and_then(Value::as_array)
		.expect("children");
	let dir = children.iter()
		.find(|child| child.get("name").and_then(Value::as_str) == Some("a"))
		.expect("dir entry");
	assert_eq!(dir.get("type").and_then(Value::as_str), Some("directory"));
	let inner = dir.get("children")
		.and_then(Value::as_array)
		.expect("inner children");
	assert_eq!(
		inner[0].get("name").and_then(Value::as_str),
		Some("inner.txt")
	);
}

#[test]
fn list_directory_tags_entries() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("file.txt"), "x");
	std::fs::create_dir(root.path().join("sub")).expect("sub");
	let mut client = RpcClient::spawn(&[root.path()], &[]);
	let resp = client.call("list_directory", json!({
		"path": root.path().to_string_lossy()
	}));
	assert!(!is_error(&resp));
	let entries = structured(&resp).get("entries")
		.and_then(Value::as_array)
		.expect("entries");
	assert_eq!(entries.len(), 2);
	let file = entries.iter()
		.find(|entry| entry.get("name").and_then(Value::as_str) == Some("file.txt"))
		.expect("file entry");
	assert_eq!(file.get("type").and_then(Value::as_str), Some("file"));
	let sub = entries.iter()
		.find(|entry| entry.get("name").and_then(Value::as_str) == Some("sub"))
		.expect("dir entry");
	assert_eq!(sub.get("type").and_then(Value::as_str), Some("directory"));
}

#[test]
fn search_files_matches_names_and_honors_excludes() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("alpha.txt"), "x");
	write_text(&root.path().join("beta.txt"), "x");
	write_text(&root.path().join("deep").join("GAMMA.TXT"), "x");
	write_text(&root.path().join("notes.md"), "x");
	let mut client = RpcClient::spawn(&[root.path()], &[]);
	let resp = client.call("search_files", json!({
		"path": root.path().to_string_lossy(),
		"pattern": "*.txt",
		"exclude_patterns": ["beta*"]
	}));
	assert!(!is_error(&resp));
	let matches = structured(&resp).get("matches")
		.and_then(Value::as_array)
		.expect("matches");
	let paths: Vec<&str> = matches.iter()
		.filter_map(|item| item.get("path").and_then(Value::as_str))
		.collect();
	assert_eq!(paths.len(), 2);
	assert!(paths.iter().any(|path| path.ends_with("alpha.txt")));
	assert!(paths.iter().any(|path| path.ends_with("GAMMA.TXT")));
}

#[test]
fn get_file_info_reports_metadata() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("info.txt"), "12345");
	let mut client = RpcClient::spawn(&[root.path()], &[]);
	let resp = client.call("get_file_info", json!({
		"path": root.path().join("info.txt").to_string_lossy()
	}));
	assert!(!is_error(&resp));
	let info = structured(&resp);
	assert_eq!(info.get("type").and_then(Value::as_str), Some("file"));
	assert_eq!(info.get("size").and_then(Value::as_u64), Some(5));
	assert!(info.get("modified").and_then(Value::as_str).is_some());
}

#[test]
fn delete_inside_readonly_root_is_denied() {
	let root = tempfile::tempdir().expect("tempdir");
	let target = root.path().join("keep.txt");
	write_text(&target, "keep");
	let mut client = RpcClient::spawn(&[], &[root.path()]);
	let resp = client.call("delete_file", json!({
		"path": target.to_string_lossy()
	}));
	assert!(is_error(&resp));
	assert_eq!(denial_code(&resp), "READ_ONLY_VIOLATION");
	assert!(target.exists());
}

#[test]
fn delete_configured_root_is_refused() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(&[root.path()], &[]);
	let resp = client.call("delete_file", json!({
		"path": root.path().to_string_lossy()
	}));
	assert!(is_error(&resp));
	assert_eq!(denial_code(&resp), "DELETE_ROOT_DENIED");
	assert!(root.path().exists());
}

#[test]
fn edit_file_dry_run_then_apply() {
	let root = tempfile::tempdir().expect("tempdir");
	let target = root.path().join("edit.txt");
	write_text(&target, "one\ntwo\nthree");
	let mut client = RpcClient::spawn(&[root.path()], &[]);
	let resp = client.call("edit_file", json!({
		"path": target.to_string_lossy(),
		"edits": [
			{ "old_text": "two", "new_text": "TWO" }
		],
		"dry_run": true
	}));
	assert!(!is_error(&resp));
	assert_eq!(
		structured(&resp).get("applied").and_then(Value::as_bool),
		Some(false)
	);
	let diff = structured(&resp).get("diff")
		.and_then(Value::as_str)
		.expect("diff");
	assert!(diff.contains("-two"));
	assert!(diff.contains("+TWO"));
	let current = std::fs::read_to_string(&target).expect("read file");
	assert!(current.contains("two"));
	let resp = client.call("edit_file", json!({
		"path": target.to_string_lossy(),
		"edits": [
			{ "old_text": "two", "new_text": "TWO" }
		]
	}));
	assert!(!is_error(&resp));
	let current = std::fs::read_to_string(&target).expect("read file");
	assert!(current.contains("TWO"));
}

#[test]
fn edit_file_unmatched_text_errors() {
	let root = tempfile::tempdir().expect("tempdir");
	let target = root.path().join("edit.txt");
	write_text(&target, "alpha");
	let mut client = RpcClient::spawn(&[root.path()], &[]);
	let resp = client.call("edit_file", json!({
		"path": target.to_string_lossy(),
		"edits": [
			{ "old_text": "missing", "new_text": "x" }
		]
	}));
	assert!(is_error(&resp));
	assert_eq!(denial_code(&resp), "EDIT_NOT_APPLIED");
}

#[test]
fn list_allowed_directories_reports_tiers() {
	let base = tempfile::tempdir().expect("tempdir");
	let work = base.path().join("work");
	let archive = base.path().join("archive");
	std::fs::create_dir_all(&work).expect("work");
	std::fs::create_dir_all(&archive).expect("archive");
	let mut client = RpcClient::spawn(&[&work], &[&archive]);
	let resp = client.call("list_allowed_directories", json!({}));
	assert!(!is_error(&resp));
	let roots = structured(&resp).get("roots")
		.and_then(Value::as_array)
		.expect("roots");
	assert_eq!(roots.len(), 2);
	let work_entry = roots.iter()
		.find(|root| {
			root.get("path")
				.and_then(Value::as_str)
				.map(|path| path.ends_with("work"))
				.unwrap_or(false)
		})
		.expect("work entry");
	assert_eq!(work_entry.get("tier").and_then(Value::as_str), Some("read-write"));
	let archive_entry = roots.iter()
		.find(|root| {
			root.get("path")
				.and_then(Value::as_str)
				.map(|path| path.ends_with("archive"))
				.unwrap_or(false)
		})
		.expect("archive entry");
	assert_eq!(archive_entry.get("tier").and_then(Value::as_str), Some("read-only"));
	let message = resp.get("result")
		.and_then(|result| result.get("content"))
		.and_then(Value::as_array)
		.and_then(|items| items.first())
		.and_then(|item| item.get("text"))
		.and_then(Value::as_str)
		.unwrap_or("");
	assert!(message.contains("Allowed directories:"));
}

#[test]
fn read_multiple_files_keeps_partial_failures() {
	let base = tempfile::tempdir().expect("tempdir");
	let root = base.path().join("root");
	let external = base.path().join("external");
	write_text(&root.join("ok.txt"), "fine");
	write_text(&external.join("far.txt"), "far");
	let mut client = RpcClient::spawn(&[&root], &[]);
	let resp = client.call("read_multiple_files", json!({
		"paths": [
			root.join("ok.txt").to_string_lossy(),
			root.join("missing.txt").to_string_lossy(),
			external.join("far.txt").to_string_lossy()
		]
	}));
	assert!(!is_error(&resp));
	let files = structured(&resp).get("files")
		.and_then(Value::as_array)
		.expect("files");
	assert_eq!(files.len(), 3);
	assert_eq!(
		files[0].get("content").and_then(Value::as_str),
		Some("fine")
	);
	assert_eq!(
		files[1].get("code").and_then(Value::as_str),
		Some("FILE_NOT_FOUND")
	);
	assert_eq!(
		files[2].get("code").and_then(Value::as_str),
		Some("OUTSIDE_SANDBOX")
	);
}

#[test]
fn tools_list_exposes_every_operation() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(&[root.path()], &[]);
	let resp = client.send("tools/list", json!({}));
	let tools = resp.get("result")
		.and_then(|result| result.get("tools"))
		.and_then(Value::as_array)
		.expect("tools");
	assert_eq!(tools.len(), 13);
	let names: Vec<&str> = tools.iter()
		.filter_map(|tool| tool.get("name").and_then(Value::as_str))
		.collect();
	for expected in [
		"read_file",
		"read_multiple_files",
		"write_file",
		"edit_file",
		"create_directory",
		"list_directory",
		"directory_tree",
		"move_file",
		"copy_file",
		"search_files",
		"get_file_info",
		"delete_file",
		"list_allowed_directories",
	] {
		assert!(names.contains(&expected), "missing tool {}", expected);
	}
}

#[test]
fn relative_segments_in_request_paths_are_resolved() {
	let root = tempfile::tempdir().expect("tempdir");
	let inner = root.path().join("inner");
	write_text(&inner.join("target.txt"), "resolved");
	let mut client = RpcClient::spawn(&[root.path()], &[]);
	let raw = format!("{}/inner/../inner/target.txt", root.path().display());
	let resp = client.call("read_file", json!({
		"path": raw
	}));
	assert!(!is_error(&resp));
	let content = structured(&resp).get("content")
		.and_then(Value::as_str)
		.expect("content");
	assert_eq!(content, "resolved");
}
