use crate::fs::normalize_path;
use once_cell::sync::Lazy;
use regex::RegexSet;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
	ReadWrite,
	ReadOnly,
}

impl Tier {
	pub fn as_str(self) -> &'static str {
		match self {
			Tier::ReadWrite => "read-write",
			Tier::ReadOnly => "read-only",
		}
	}
}

#[derive(Clone, Debug)]
pub struct AllowedRoot {
	pub canonical: PathBuf,
	pub display: String,
	pub tier: Tier,
}

#[derive(Clone, Debug)]
pub struct RejectedRoot {
	pub raw: String,
	pub reason: &'static str,
}

#[derive(Clone, Debug, Default)]
pub struct Registry {
	roots: Vec<AllowedRoot>,
}

impl Registry {
	pub fn build(candidates: &[(String, Tier)]) -> (Self, Vec<RejectedRoot>) {
		let mut roots = Vec::new();
		let mut rejected = Vec::new();
		for (raw, tier) in candidates {
			let absolute = absolutize(&expand_home(raw));
			match std::fs::metadata(&absolute) {
				Ok(meta) if meta.is_dir() => {
					let canonical = absolute.canonicalize().unwrap_or_else(|_| absolute.clone());
					roots.push(AllowedRoot {
						canonical,
						display: absolute.to_string_lossy().to_string(),
						tier: *tier,
					});
				}
				Ok(_) => rejected.push(RejectedRoot {
					raw: raw.clone(),
					reason: "not a directory"
				}),
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => rejected.push(RejectedRoot {
					raw: raw.clone(),
					reason: "not found"
				}),
				Err(_) => rejected.push(RejectedRoot {
					raw: raw.clone(),
					reason: "access denied"
				}),
			}
		}
		(Self { roots }, rejected)
	}

	pub fn roots(&self) -> &[AllowedRoot] {
		&self.roots
	}

	pub fn summary(&self) -> String {
		if self.roots.is_empty() {
			return "none".to_string();
		}
		self.roots
			.iter()
			.map(|root| format!("{} ({})", root.display, root.tier.as_str()))
			.collect::<Vec<_>>()
			.join(", ")
	}

	pub fn tier_of(&self, canonical: &Path) -> Option<Tier> {
		let mut best: Option<(usize, Tier)> = None;
		for root in &self.roots {
			if canonical.starts_with(&root.canonical) {
				let depth = root.canonical.components().count();
				if best.map(|(best_depth, _)| depth > best_depth).unwrap_or(true) {
					best = Some((depth, root.tier));
				}
			}
		}
		best.map(|(_, tier)| tier)
	}

	pub fn is_root(&self, canonical: &Path) -> bool {
		self.roots.iter().any(|root| root.canonical == canonical)
	}
}

#[derive(Clone, Debug)]
pub struct ResolvedPath {
	pub canonical: PathBuf,
	pub existed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
	Read,
	ReadMulti,
	Write,
	Edit,
	CreateDir,
	ListDir,
	Tree,
	Move,
	Copy,
	Search,
	GetInfo,
	Delete,
	ListRoots,
}

#[derive(Debug)]
pub enum SandboxError {
	InvalidPath {
		path: String,
		reason: String,
	},
	OutsideSandbox {
		path: PathBuf,
		allowed: String,
	},
	ReadOnlyViolation {
		path: PathBuf,
	},
	SystemPathBlocked {
		path: PathBuf,
	},
}

impl SandboxError {
	fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
		SandboxError::InvalidPath {
			path: path.into(),
			reason: reason.into()
		}
	}

	pub fn code(&self) -> &'static str {
		match self {
			SandboxError::InvalidPath { .. } => "INVALID_PATH",
			SandboxError::OutsideSandbox { .. } => "OUTSIDE_SANDBOX",
			SandboxError::ReadOnlyViolation { .. } => "READ_ONLY_VIOLATION",
			SandboxError::SystemPathBlocked { .. } => "SYSTEM_PATH_BLOCKED",
		}
	}

	pub fn denied_path(&self) -> String {
		match self {
			SandboxError::InvalidPath { path, .. } => path.clone(),
			SandboxError::OutsideSandbox { path, .. } => path.to_string_lossy().to_string(),
			SandboxError::ReadOnlyViolation { path } => path.to_string_lossy().to_string(),
			SandboxError::SystemPathBlocked { path } => path.to_string_lossy().to_string(),
		}
	}
}

impl std::fmt::Display for SandboxError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			SandboxError::InvalidPath { path, reason } => {
				write!(f, "invalid path {}: {}", path, reason)
			}
			SandboxError::OutsideSandbox { path, allowed } => {
				write!(
					f,
					"access denied - path outside allowed directories: {} not in {}",
					path.display(),
					allowed
				)
			}
			SandboxError::ReadOnlyViolation { path } => {
				write!(
					f,
					"permission denied - {} is in a read-only directory",
					path.display()
				)
			}
			SandboxError::SystemPathBlocked { path } => {
				write!(
					f,
					"deletion blocked - {} is a protected system path",
					path.display()
				)
			}
		}
	}
}

impl std::error::Error for SandboxError {}

pub fn resolve(raw: &str) -> Result<ResolvedPath, SandboxError> {
	if raw.is_empty() {
		return Err(SandboxError::invalid(raw, "empty path"));
	}
	let expanded = expand_home(raw);
	let candidate = if expanded.is_absolute() {
		normalize_path(&expanded)
	}
	else {
		let cwd = std::env::current_dir()
			.map_err(|err| SandboxError::invalid(raw, format!("cannot determine working directory: {}", err)))?;
		normalize_path(&cwd.join(expanded))
	};
	match candidate.canonicalize() {
		Ok(real) => Ok(ResolvedPath {
			canonical: real,
			existed: true
		}),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
			let (Some(parent), Some(name)) = (candidate.parent(), candidate.file_name()) else {
				return Err(SandboxError::invalid(raw, "cannot access path"));
			};
			match std::fs::metadata(parent) {
				Ok(meta) if meta.is_dir() => {
					// the leaf does not exist yet; containment is judged on the
					// canonical parent so a symlinked ancestor cannot skew it
					let parent = parent.canonicalize().unwrap_or_else(|_| parent.to_path_buf());
					Ok(ResolvedPath {
						canonical: parent.join(name),
						existed: false
					})
				}
				Ok(_) => Err(SandboxError::invalid(raw, "parent is not a directory")),
				Err(_) => Err(SandboxError::invalid(raw, "parent directory does not exist")),
			}
		}
		Err(_) => {
			// realpath can fail on platform roots; a plain existence probe
			// is enough to keep containment honest for those.
			if candidate.exists() {
				Ok(ResolvedPath {
					canonical: candidate,
					existed: true
				})
			}
			else {
				Err(SandboxError::invalid(raw, "cannot access path"))
			}
		}
	}
}

pub struct Gate {
	registry: Registry,
}

impl Gate {
	pub fn new(registry: Registry) -> Self {
		Self { registry }
	}

	pub fn registry(&self) -> &Registry {
		&self.registry
	}

	pub fn authorize(
		&self,
		kind: OperationKind,
		raw_paths: &[&str]) -> Result<Vec<ResolvedPath>, SandboxError> {
		let mut slots = Vec::with_capacity(raw_paths.len());
		for raw in raw_paths {
			let resolved = resolve(raw)?;
			let Some(tier) = self.registry.tier_of(&resolved.canonical) else {
				if resolved.existed {
					return Err(SandboxError::OutsideSandbox {
						path: resolved.canonical,
						allowed: self.registry.summary()
					});
				}
				return Err(SandboxError::invalid(
					*raw,
					"parent directory outside allowed directories"
				));
			};
			slots.push((resolved, tier));
		}
		evaluate(kind, &slots)?;
		Ok(slots.into_iter().map(|(resolved, _)| resolved).collect())
	}
}

fn evaluate(kind: OperationKind, slots: &[(ResolvedPath, Tier)]) -> Result<(), SandboxError> {
	match kind {
		OperationKind::Read
		| OperationKind::ReadMulti
		| OperationKind::ListDir
		| OperationKind::Tree
		| OperationKind::Search
		| OperationKind::GetInfo
		| OperationKind::ListRoots => Ok(()),
		OperationKind::Write | OperationKind::Edit | OperationKind::CreateDir => {
			deny_read_only(slots)
		}
		OperationKind::Move => deny_read_only(slots),
		OperationKind::Copy => match slots.get(1) {
			Some(destination) => deny_read_only(std::slice::from_ref(destination)),
			None => Err(SandboxError::invalid("", "copy requires a destination")),
		},
		OperationKind::Delete => {
			for (resolved, _) in slots {
				if is_system_path(&resolved.canonical) {
					return Err(SandboxError::SystemPathBlocked {
						path: resolved.canonical.clone()
					});
				}
			}
			deny_read_only(slots)
		}
	}
}

fn deny_read_only(slots: &[(ResolvedPath, Tier)]) -> Result<(), SandboxError> {
	for (resolved, tier) in slots {
		if *tier == Tier::ReadOnly {
			return Err(SandboxError::ReadOnlyViolation {
				path: resolved.canonical.clone()
			});
		}
	}
	Ok(())
}

static SYSTEM_PATHS: Lazy<RegexSet> = Lazy::new(
	|| {
		RegexSet::new([
			r"^/$",
			r"^/(etc|bin|sbin|usr|var|boot|lib|lib32|lib64|proc|sys|dev)(/|$)",
			r"(?i)^[a-z]:[\\/]?$",
			r"(?i)^[a-z]:[\\/](windows|system32|boot|program files)([\\/]|$)",
		]).expect("system path patterns")
	}
);

pub fn is_system_path(path: &Path) -> bool {
	SYSTEM_PATHS.is_match(&path.to_string_lossy())
}

fn expand_home(raw: &str) -> PathBuf {
	if raw != "~" && !raw.starts_with("~/") {
		return PathBuf::from(raw);
	}
	let Some(dirs) = directories::UserDirs::new() else {
		return PathBuf::from(raw);
	};
	if raw == "~" {
		return dirs.home_dir().to_path_buf();
	}
	dirs.home_dir().join(&raw[2..])
}

fn absolutize(path: &Path) -> PathBuf {
	if path.is_absolute() {
		return normalize_path(path);
	}
	match std::env::current_dir() {
		Ok(cwd) => normalize_path(&cwd.join(path)),
		Err(_) => normalize_path(path),
	}
}
