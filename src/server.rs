use crate::fs;
use crate::protocol::{Request, Response};
use crate::sandbox::{Gate, OperationKind, Registry, SandboxError, Tier};
use anyhow::{anyhow, Result};
use opentelemetry::global;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions::resource as semconv;
use serde_json::{json, Value};
use std::path::Path;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, info_span, warn, Span};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug)]
struct ProtocolError {
	code: i64,
	message: String,
}

impl ProtocolError {
	fn new(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into()
		}
	}
}

impl std::fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for ProtocolError {}

#[derive(Clone, Debug)]
pub struct Config {
	pub readwrite_dirs: Vec<String>,
	pub readonly_dirs: Vec<String>,
	pub otel_enabled: bool,
	pub otel_endpoint: String,
	pub otel_service_name: String,
	pub session_id: String,
}

pub fn load_config() -> Result<Config> {
	let mut readwrite_dirs: Vec<String> = Vec::new();
	let mut readonly_dirs: Vec<String> = Vec::new();
	let mut otel_enabled = true;
	let mut otel_endpoint = String::from("http://127.0.0.1:4317");
	let mut otel_service_name = String::from("fsgate");
	let mut mode: Option<Tier> = None;
	let mut args = std::env::args().skip(1);
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--readwrite" => {
				mode = Some(Tier::ReadWrite);
			}
			"--readonly" => {
				mode = Some(Tier::ReadOnly);
			}
			"--otel-enabled" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-enabled requires a value"))?;
				otel_enabled = parse_bool(&value, "--otel-enabled")?;
			}
			"--otel-endpoint" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-endpoint requires a value"))?;
				otel_endpoint = value;
			}
			"--otel-service-name" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-service-name requires a value"))?;
				otel_service_name = value;
			}
			other => {
				if other.starts_with("--") {
					return Err(anyhow!("unknown argument: {}", other));
				}
				// bare arguments before any tier flag are legacy read-write
				let target = match mode {
					Some(Tier::ReadOnly) => &mut readonly_dirs,
					_ => &mut readwrite_dirs,
				};
				push_dir_list(target, other);
			}
		}
	}
	if readwrite_dirs.is_empty() {
		if let Ok(env_dirs) = std::env::var("FSGATE_READWRITE_DIRS") {
			push_dir_list(&mut readwrite_dirs, &env_dirs);
		}
	}
	if readonly_dirs.is_empty() {
		if let Ok(env_dirs) = std::env::var("FSGATE_READONLY_DIRS") {
			push_dir_list(&mut readonly_dirs, &env_dirs);
		}
	}
	if let Ok(env_enabled) = std::env::var("FSGATE_OTEL_ENABLED") {
		if !env_enabled.trim().is_empty() {
			otel_enabled = parse_bool(&env_enabled, "FSGATE_OTEL_ENABLED")?;
		}
	}
	if let Ok(env_endpoint) = std::env::var("FSGATE_OTEL_ENDPOINT") {
		if !env_endpoint.trim().is_empty() {
			otel_endpoint = env_endpoint;
		}
	}
	if let Ok(env_service) = std::env::var("FSGATE_OTEL_SERVICE_NAME") {
		if !env_service.trim().is_empty() {
			otel_service_name = env_service;
		}
	}
	Ok(Config {
		readwrite_dirs,
		readonly_dirs,
		otel_enabled,
		otel_endpoint,
		otel_service_name,
		session_id: uuid::Uuid::new_v4().to_string(),
	})
}

fn push_dir_list(target: &mut Vec<String>, raw: &str) {
	for part in raw.split(',') {
		let trimmed = part.trim();
		if !trimmed.is_empty() {
			target.push(trimmed.to_string());
		}
	}
}

fn parse_bool(value: &str, label: &str) -> Result<bool> {
	let value = value.trim().to_lowercase();
	match value.as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(anyhow!("{} must be a boolean", label)),
	}
}

pub fn init_tracing(config: &Config) {
	let _ = global::set_error_handler(|_| {});
	let resource = Resource::new(
		vec![
		opentelemetry::KeyValue::new(semconv::SERVICE_NAME, config.otel_service_name.clone()),
		opentelemetry::KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
		opentelemetry::KeyValue::new("fsgate.session_id", config.session_id.clone()),
		]
	);
	let tracing_layer = if config.otel_enabled {
		let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(config.otel_endpoint.clone());
		let provider = opentelemetry_otlp::new_pipeline()
			.tracing()
			.with_exporter(exporter)
			.with_trace_config(sdktrace::Config::default().with_resource(resource))
			.install_batch(opentelemetry_sdk::runtime::Tokio)
			.ok();
		if let Some(tracer) = provider {
			Some(OpenTelemetryLayer::new(tracer))
		}
		else {
			None
		}
	}
	else {
		None
	};
	// stdout carries the protocol stream; diagnostics go to stderr
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_target(false)
		.with_writer(std::io::stderr);
	let subscriber = tracing_subscriber::registry().with(fmt_layer);
	if let Some(layer) = tracing_layer {
		subscriber.with(layer).init();
	}
	else {
		subscriber.init();
	}
}

pub async fn run(config: Config) -> Result<()> {
	let mut candidates: Vec<(String, Tier)> = Vec::new();
	for dir in &config.readwrite_dirs {
		candidates.push((dir.clone(), Tier::ReadWrite));
	}
	for dir in &config.readonly_dirs {
		candidates.push((dir.clone(), Tier::ReadOnly));
	}
	let (registry, rejected) = Registry::build(&candidates);
	for reject in &rejected {
		warn!("skipping configured directory {}: {}", reject.raw, reject.reason);
	}
	if registry.roots().is_empty() {
		warn!("no valid directories configured; every filesystem operation will be denied");
	}
	for root in registry.roots() {
		info!("serving {} ({})", root.display, root.tier.as_str());
	}
	let gate = Gate::new(registry);
	let stdin = io::stdin();
	let stdout = io::stdout();
	let mut reader = BufReader::new(stdin).lines();
	let mut writer = io::BufWriter::new(stdout);
	while let Some(line) = reader.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let req: Request = match serde_json::from_str(&line) {
			Ok(req) => req,
			Err(err) => {
				let resp = Response::err(Value::Null, -32700, err.to_string());
				write_response(&mut writer, resp).await?;
				continue;
			}
		};
		let resp = handle_request(&config, &gate, req).await;
		write_response(&mut writer, resp).await?;
	}
	Ok(())
}

async fn handle_request(config: &Config, gate: &Gate, req: Request) -> Response {
	let method = req.method.clone();
	let tool_name = extract_tool_name(&method, &req.params);
	let span = info_span!(
		"fsgate.request",
		"session_id" = %config.session_id,
		"rpc.method" = %method,
		"tool" = tool_name.as_deref().unwrap_or(""),
		"is_error" = tracing::field::Empty,
		"error_code" = tracing::field::Empty,
		"response_bytes" = tracing::field::Empty,
	);
	let _guard = span.enter();
	match route(gate, &req).await {
		Ok(value) => {
			record_result(&span, &value);
			Response::ok(req.id, value)
		}
		Err(err) => {
			if let Some(protocol) = err.downcast_ref::<ProtocolError>() {
				Response::err(req.id, protocol.code, protocol.message.clone())
			}
			else {
				Response::err(req.id, -32000, err.to_string())
			}
		}
	}
}

async fn route(gate: &Gate, req: &Request) -> Result<Value> {
	match req.method.as_str() {
		"initialize" => Ok(json!({
			"serverInfo": {
				"name": "fsgate",
				"version": env!("CARGO_PKG_VERSION")
			},
			"capabilities": {
				"tools": {
					"list": true,
					"call": true
				}
			}
		})),
		"tools/list" => Ok(json!({
			"tools": tool_definitions(),
		})),
		"tools/call" => {
			let name = req.params
				.get("name")
				.and_then(Value::as_str)
				.ok_or_else(|| ProtocolError::new(-32602, "name is required"))?;
			let arguments = req.params
				.get("arguments")
				.cloned()
				.unwrap_or_else(|| json!({}));
			execute_tool(gate, name, &arguments).await
		}
		_ => Err(ProtocolError::new(-32601, "method not found").into()),
	}
}

fn operation_kind(name: &str) -> Option<OperationKind> {
	match name {
		"read_file" => Some(OperationKind::Read),
		"read_multiple_files" => Some(OperationKind::ReadMulti),
		"write_file" => Some(OperationKind::Write),
		"edit_file" => Some(OperationKind::Edit),
		"create_directory" => Some(OperationKind::CreateDir),
		"list_directory" => Some(OperationKind::ListDir),
		"directory_tree" => Some(OperationKind::Tree),
		"move_file" => Some(OperationKind::Move),
		"copy_file" => Some(OperationKind::Copy),
		"search_files" => Some(OperationKind::Search),
		"get_file_info" => Some(OperationKind::GetInfo),
		"delete_file" => Some(OperationKind::Delete),
		"list_allowed_directories" => Some(OperationKind::ListRoots),
		_ => None,
	}
}

async fn execute_tool(gate: &Gate, name: &str, args: &Value) -> Result<Value> {
	let Some(kind) = operation_kind(name) else {
		return Err(ProtocolError::new(-32601, "unknown tool").into());
	};
	let value = match kind {
		OperationKind::Read => run_tool(name, gate, || async {
			read_file_tool(gate, args).await
		}).await,
		OperationKind::ReadMulti => run_tool(name, gate, || async {
			read_multiple_files_tool(gate, args).await
		}).await,
		OperationKind::Write => run_tool(name, gate, || async {
			write_file_tool(gate, args).await
		}).await,
		OperationKind::Edit => run_tool(name, gate, || async {
			edit_file_tool(gate, args).await
		}).await,
		OperationKind::CreateDir => run_tool(name, gate, || async {
			create_directory_tool(gate, args).await
		}).await,
		OperationKind::ListDir => run_tool(name, gate, || async {
			list_directory_tool(gate, args).await
		}).await,
		OperationKind::Tree => run_tool(name, gate, || async {
			directory_tree_tool(gate, args).await
		}).await,
		OperationKind::Move => run_tool(name, gate, || async {
			move_file_tool(gate, args).await
		}).await,
		OperationKind::Copy => run_tool(name, gate, || async {
			copy_file_tool(gate, args).await
		}).await,
		OperationKind::Search => run_tool(name, gate, || async {
			search_files_tool(gate, args).await
		}).await,
		OperationKind::GetInfo => run_tool(name, gate, || async {
			get_file_info_tool(gate, args).await
		}).await,
		OperationKind::Delete => run_tool(name, gate, || async {
			delete_file_tool(gate, args).await
		}).await,
		OperationKind::ListRoots => run_tool(name, gate, || async {
			list_allowed_directories_tool(gate).await
		}).await,
	};
	Ok(value)
}

async fn run_tool<F, Fut>(
	name: &str,
	gate: &Gate,
	handler: F) -> Value
where
	F: FnOnce() -> Fut,
	Fut: std::future::Future<Output = Result<Value>>, {
	match handler().await {
		Ok(structured) => tool_success(name, structured),
		Err(err) => tool_error(gate, &err),
	}
}

fn tool_success(name: &str, structured: Value) -> Value {
	let message = tool_message(name, &structured);
	json!({
		"structuredContent": structured,
		"content": [
			{
				"type": "text",
				"text": message
			}
		]
	})
}

fn tool_error(gate: &Gate, err: &anyhow::Error) -> Value {
	if let Some(sandbox) = err.downcast_ref::<SandboxError>() {
		return json!({
			"isError": true,
			"structuredContent": {
				"code": sandbox.code(),
				"denied_path": sandbox.denied_path(),
				"allowed_roots": gate.registry().summary()
			},
			"content": [
				{
					"type": "text",
					"text": err.to_string()
				}
			]
		});
	}
	let message = err.to_string();
	let code = error_code(&message);
	json!({
		"isError": true,
		"structuredContent": {
			"code": code
		},
		"content": [
			{
				"type": "text",
				"text": message
			}
		]
	})
}

async fn read_file_tool(gate: &Gate, args: &Value) -> Result<Value> {
	let path = require_str(args, "path")?;
	let resolved = gate.authorize(OperationKind::Read, &[path])?;
	let target = &resolved[0];
	let content = tokio::fs::read_to_string(&target.canonical).await
		.map_err(|err| format_io_error("read", &target.canonical, err.into()))?;
	let bytes = content.as_bytes().len();
	Ok(json!({
		"path": target.canonical.to_string_lossy(),
		"content": content,
		"bytes": bytes
	}))
}

async fn read_multiple_files_tool(gate: &Gate, args: &Value) -> Result<Value> {
	let paths = args.get("paths")
		.ok_or_else(|| anyhow!("paths is required"))?.as_array()
		.ok_or_else(|| anyhow!("paths must be an array"))?;
	if paths.is_empty() {
		return Err(anyhow!("paths is empty"));
	}
	let mut files = Vec::new();
	for path_value in paths {
		let Some(path) = path_value.as_str() else {
			continue;
		};
		let resolved = match gate.authorize(OperationKind::ReadMulti, &[path]) {
			Ok(resolved) => resolved,
			Err(err) => {
				files.push(json!({
					"path": path,
					"code": err.code(),
					"error": err.to_string()
				}));
				continue;
			}
		};
		let target = &resolved[0];
		match tokio::fs::read_to_string(&target.canonical).await {
			Ok(content) => {
				files.push(json!({
					"path": target.canonical.to_string_lossy(),
					"content": content
				}));
			}
			Err(err) => {
				let wrapped = format_io_error("read", &target.canonical, err.into());
				files.push(json!({
					"path": target.canonical.to_string_lossy(),
					"code": error_code(&wrapped.to_string()),
					"error": wrapped.to_string()
				}));
			}
		}
	}
	let count = files.len();
	Ok(json!({
		"files": files,
		"count": count
	}))
}

async fn write_file_tool(gate: &Gate, args: &Value) -> Result<Value> {
	let path = require_str(args, "path")?;
	let content = require_str(args, "content")?;
	let resolved = gate.authorize(OperationKind::Write, &[path])?;
	let target = &resolved[0];
	tokio::fs::write(&target.canonical, content).await
		.map_err(|err| format_io_error("write", &target.canonical, err.into()))?;
	Ok(json!({
		"path": target.canonical.to_string_lossy(),
		"bytes": content.as_bytes().len(),
		"created": !target.existed
	}))
}

async fn edit_file_tool(gate: &Gate, args: &Value) -> Result<Value> {
	let path = require_str(args, "path")?;
	let edits_value = args.get("edits")
		.ok_or_else(|| anyhow!("edits is required"))?.as_array()
		.ok_or_else(|| anyhow!("edits must be an array"))?;
	if edits_value.is_empty() {
		return Err(anyhow!("edits is empty"));
	}
	let dry_run = args.get("dry_run")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	let edits = edits_value.iter()
		.map(
			|edit| {
				let old_text = edit.get("old_text")
					.and_then(Value::as_str)
					.ok_or_else(|| anyhow!("old_text is required"))?;
				let new_text = edit.get("new_text")
					.and_then(Value::as_str)
					.ok_or_else(|| anyhow!("new_text is required"))?;
				Ok(fs::EditSpec {
					old_text: old_text.to_string(),
					new_text: new_text.to_string()
				})
			})
		.collect::<Result<Vec<_>>>()?;
	let resolved = gate.authorize(OperationKind::Edit, &[path])?;
	let target = &resolved[0];
	let existing = tokio::fs::read_to_string(&target.canonical).await
		.map_err(|err| format_io_error("read", &target.canonical, err.into()))?;
	let updated = fs::apply_edits(&existing, &edits)?;
	let diff = fs::make_diff(&existing, &updated, &target.canonical.to_string_lossy());
	if !dry_run {
		tokio::fs::write(&target.canonical, &updated).await
			.map_err(|err| format_io_error("write", &target.canonical, err.into()))?;
	}
	Ok(json!({
		"path": target.canonical.to_string_lossy(),
		"diff": diff,
		"applied": !dry_run,
		"edit_count": edits.len()
	}))
}

async fn create_directory_tool(gate: &Gate, args: &Value) -> Result<Value> {
	let path = require_str(args, "path")?;
	let resolved = gate.authorize(OperationKind::CreateDir, &[path])?;
	let target = &resolved[0];
	tokio::fs::create_dir_all(&target.canonical).await
		.map_err(|err| format_io_error("create directory", &target.canonical, err.into()))?;
	Ok(json!({
		"path": target.canonical.to_string_lossy(),
		"created": !target.existed
	}))
}

async fn list_directory_tool(gate: &Gate, args: &Value) -> Result<Value> {
	let path = require_str(args, "path")?;
	let resolved = gate.authorize(OperationKind::ListDir, &[path])?;
	let target = &resolved[0];
	let mut listing = fs::list_directory(&target.canonical).await
		.map_err(|err| format_io_error("list", &target.canonical, err))?;
	if let Some(obj) = listing.as_object_mut() {
		obj.insert(
			"path".to_string(),
			Value::String(target.canonical.to_string_lossy().to_string())
		);
	}
	Ok(listing)
}

async fn directory_tree_tool(gate: &Gate, args: &Value) -> Result<Value> {
	let path = require_str(args, "path")?;
	let resolved = gate.authorize(OperationKind::Tree, &[path])?;
	let target = &resolved[0];
	let tree = fs::directory_tree(&target.canonical).await
		.map_err(|err| format_io_error("tree", &target.canonical, err))?;
	Ok(json!({
		"path": target.canonical.to_string_lossy(),
		"tree": tree
	}))
}

async fn move_file_tool(gate: &Gate, args: &Value) -> Result<Value> {
	let source = require_str(args, "source")?;
	let destination = require_str(args, "destination")?;
	let resolved = gate.authorize(OperationKind::Move, &[source, destination])?;
	let from = &resolved[0];
	let to = &resolved[1];
	if gate.registry().is_root(&from.canonical) || gate.registry().is_root(&to.canonical) {
		return Err(anyhow!("cannot move root"));
	}
	fs::move_path(&from.canonical, &to.canonical).await
		.map_err(|err| format_io_error("move", &from.canonical, err))?;
	Ok(json!({
		"source": from.canonical.to_string_lossy(),
		"destination": to.canonical.to_string_lossy()
	}))
}

async fn copy_file_tool(gate: &Gate, args: &Value) -> Result<Value> {
	let source = require_str(args, "source")?;
	let destination = require_str(args, "destination")?;
	let resolved = gate.authorize(OperationKind::Copy, &[source, destination])?;
	let from = &resolved[0];
	let to = &resolved[1];
	fs::copy_path(&from.canonical, &to.canonical).await
		.map_err(|err| format_io_error("copy", &from.canonical, err))?;
	Ok(json!({
		"source": from.canonical.to_string_lossy(),
		"destination": to.canonical.to_string_lossy()
	}))
}

async fn search_files_tool(gate: &Gate, args: &Value) -> Result<Value> {
	let path = require_str(args, "path")?;
	let pattern = require_str(args, "pattern")?;
	let exclude = args.get("exclude_patterns")
		.and_then(Value::as_array)
		.map(
			|items| {
				items.iter()
					.filter_map(|item| item.as_str().map(|value| value.to_string()))
					.collect::<Vec<_>>()
			})
		.unwrap_or_default();
	let resolved = gate.authorize(OperationKind::Search, &[path])?;
	let target = &resolved[0];
	let mut results = fs::search_files(&target.canonical, pattern, &exclude).await
		.map_err(|err| format_io_error("search", &target.canonical, err))?;
	if let Some(obj) = results.as_object_mut() {
		obj.insert(
			"path".to_string(),
			Value::String(target.canonical.to_string_lossy().to_string())
		);
	}
	Ok(results)
}

async fn get_file_info_tool(gate: &Gate, args: &Value) -> Result<Value> {
	let path = require_str(args, "path")?;
	let resolved = gate.authorize(OperationKind::GetInfo, &[path])?;
	let target = &resolved[0];
	fs::file_info(&target.canonical).await
		.map_err(|err| format_io_error("stat", &target.canonical, err))
}

async fn delete_file_tool(gate: &Gate, args: &Value) -> Result<Value> {
	let path = require_str(args, "path")?;
	let resolved = gate.authorize(OperationKind::Delete, &[path])?;
	let target = &resolved[0];
	if gate.registry().is_root(&target.canonical) {
		return Err(anyhow!("cannot delete root"));
	}
	fs::delete_path(&target.canonical).await
		.map_err(|err| format_io_error("delete", &target.canonical, err))?;
	Ok(json!({
		"path": target.canonical.to_string_lossy()
	}))
}

async fn list_allowed_directories_tool(gate: &Gate) -> Result<Value> {
	gate.authorize(OperationKind::ListRoots, &[])?;
	let roots: Vec<Value> = gate.registry()
		.roots()
		.iter()
		.map(
			|root| {
				json!({
					"path": root.display,
					"tier": root.tier.as_str()
				})
			})
		.collect();
	let count = roots.len();
	Ok(json!({
		"roots": roots,
		"count": count
	}))
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
	args.get(key)
		.and_then(Value::as_str)
		.ok_or_else(|| anyhow!("{} is required", key))
}

fn tool_message(name: &str, structured: &Value) -> String {
	match name {
		"read_file" => {
			let path = get_str(structured, "path").unwrap_or("file");
			let bytes = get_u64(structured, "bytes").unwrap_or(0);
			format!("Read {} byte(s) from {}.", bytes, path)
		}
		"read_multiple_files" => {
			let count = get_u64(structured, "count").unwrap_or(0);
			format!("Read {} file(s).", count)
		}
		"write_file" => {
			let path = get_str(structured, "path").unwrap_or("file");
			format!("Wrote {}.", path)
		}
		"edit_file" => {
			let path = get_str(structured, "path").unwrap_or("file");
			let applied = structured.get("applied")
				.and_then(Value::as_bool)
				.unwrap_or(false);
			let count = get_u64(structured, "edit_count").unwrap_or(0);
			if applied {
				format!("Applied {} edit(s) to {}.", count, path)
			}
			else {
				format!("Previewed {} edit(s) for {}.", count, path)
			}
		}
		"create_directory" => {
			let path = get_str(structured, "path").unwrap_or("directory");
			format!("Created directory {}.", path)
		}
		"list_directory" => {
			let count = get_u64(structured, "count").unwrap_or(0);
			let path = get_str(structured, "path").unwrap_or("directory");
			format!("Listed {} entr(ies) in {}.", count, path)
		}
		"directory_tree" => {
			let path = get_str(structured, "path").unwrap_or("directory");
			format!("Built directory tree for {}.", path)
		}
		"move_file" => {
			let from = get_str(structured, "source").unwrap_or("source");
			let to = get_str(structured, "destination").unwrap_or("destination");
			format!("Moved {} to {}.", from, to)
		}
		"copy_file" => {
			let from = get_str(structured, "source").unwrap_or("source");
			let to = get_str(structured, "destination").unwrap_or("destination");
			format!("Copied {} to {}.", from, to)
		}
		"search_files" => {
			let count = get_u64(structured, "count").unwrap_or(0);
			format!("Found {} match(es).", count)
		}
		"get_file_info" => {
			let path = get_str(structured, "path").unwrap_or("file");
			format!("Collected metadata for {}.", path)
		}
		"delete_file" => {
			let path = get_str(structured, "path").unwrap_or("file");
			format!("Deleted {}.", path)
		}
		"list_allowed_directories" => {
			let roots = structured.get("roots")
				.and_then(Value::as_array)
				.cloned()
				.unwrap_or_default();
			if roots.is_empty() {
				return "No directories configured.".to_string();
			}
			let lines: Vec<String> = roots.iter()
				.map(
					|root| {
						format!(
							"{} ({})",
							root.get("path").and_then(Value::as_str).unwrap_or(""),
							root.get("tier").and_then(Value::as_str).unwrap_or("")
						)
					})
				.collect();
			format!("Allowed directories:\n{}", lines.join("\n"))
		}
		_ => "Completed tool call.".to_string(),
	}
}

fn get_u64(value: &Value, key: &str) -> Option<u64> {
	value.get(key).and_then(Value::as_u64)
}

fn get_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
	value.get(key).and_then(Value::as_str)
}

fn error_code(message: &str) -> &'static str {
	let lower = message.to_lowercase();
	if lower.contains("is required") || lower.contains("must be") || lower.contains("is empty") {
		"INVALID_ARGUMENTS"
	}
	else if lower.contains("target exists") {
		"TARGET_EXISTS"
	}
	else if lower.contains("old text not found") {
		"EDIT_NOT_APPLIED"
	}
	else if lower.contains("invalid pattern") || lower.contains("invalid exclude") {
		"INVALID_PATTERN"
	}
	else if lower.contains("cannot delete root") {
		"DELETE_ROOT_DENIED"
	}
	else if lower.contains("cannot move root") {
		"MOVE_ROOT_DENIED"
	}
	else if lower.contains("not found") {
		"FILE_NOT_FOUND"
	}
	else if lower.contains("permission denied") {
		"PERMISSION_DENIED"
	}
	else if lower.contains("not empty") {
		"NOT_EMPTY"
	}
	else {
		"EXECUTION_ERROR"
	}
}

fn format_io_error(action: &str, path: &Path, err: anyhow::Error) -> anyhow::Error {
	if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
		let reason = match io_err.kind() {
			std::io::ErrorKind::NotFound => "not found",
			std::io::ErrorKind::PermissionDenied => "permission denied",
			std::io::ErrorKind::AlreadyExists => "target exists",
			std::io::ErrorKind::InvalidInput => "invalid input",
			_ => {
				if io_err.raw_os_error() == Some(libc::ENOTEMPTY) {
					"not empty"
				}
				else {
					"io error"
				}
			}
		};
		return anyhow!("{} {}: {}", action, path.display(), reason);
	}
	err
}

fn extract_tool_name(method: &str, params: &Value) -> Option<String> {
	if method != "tools/call" {
		return None;
	}
	params.get("name")
		.and_then(Value::as_str)
		.map(|value| value.to_string())
}

fn record_result(span: &Span, result: &Value) {
	let response_bytes = serde_json::to_string(result).map(|value| value.as_bytes().len() as u64).ok();
	if let Some(bytes) = response_bytes {
		span.record("response_bytes", bytes);
	}
	let is_error = result.get("isError")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	span.record("is_error", is_error);
	if let Some(code) = result.get("structuredContent")
		.and_then(|value| value.get("code"))
		.and_then(Value::as_str) {
		span.record("error_code", code);
	}
}

async fn write_response(writer: &mut io::BufWriter<io::Stdout>, resp: Response) -> Result<()> {
	let line = serde_json::to_string(&resp)?;
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await?;
	Ok(())
}

fn tool_definitions() -> Vec<Value> {
	vec![
	json!({
		"name": "read_file",
		"description": "read the complete contents of a file; only works within allowed directories",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": { "type": "string", "description": "Path to the file. Supports ~, relative, and absolute forms." }
			},
			"required": ["path"]
		}
	}),
	json!({
		"name": "read_multiple_files",
		"description": "read several files in one call; failures for individual files do not abort the batch",
		"inputSchema": {
			"type": "object",
			"properties": {
				"paths": { "type": "array", "items": { "type": "string" }, "description": "Paths to read." }
			},
			"required": ["paths"]
		}
	}),
	json!({
		"name": "write_file",
		"description": "create or overwrite a file; denied inside read-only directories",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": { "type": "string", "description": "Target path. The parent directory must already exist." },
				"content": { "type": "string", "description": "Full file content." }
			},
			"required": ["path", "content"]
		}
	}),
	json!({
		"name": "edit_file",
		"description": "apply exact text replacements to a file and return a git-style diff; denied inside read-only directories",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": { "type": "string", "description": "File to edit." },
				"edits": {
					"type": "array",
					"items": {
						"type": "object",
						"properties": {
							"old_text": { "type": "string", "description": "Text to search for - must match exactly." },
							"new_text": { "type": "string", "description": "Replacement text." }
						},
						"required": ["old_text", "new_text"]
					}
				},
				"dry_run": { "type": "boolean", "description": "Preview the diff without writing. Default: false." }
			},
			"required": ["path", "edits"]
		}
	}),
	json!({
		"name": "create_directory",
		"description": "create a directory, succeeding silently if it already exists",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": { "type": "string", "description": "Directory to create." }
			},
			"required": ["path"]
		}
	}),
	json!({
		"name": "list_directory",
		"description": "list entries of a directory, tagged as file or directory",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": { "type": "string", "description": "Directory to list." }
			},
			"required": ["path"]
		}
	}),
	json!({
		"name": "directory_tree",
		"description": "recursive tree view of files and directories as JSON, depth-capped",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": { "type": "string", "description": "Directory to walk." }
			},
			"required": ["path"]
		}
	}),
	json!({
		"name": "move_file",
		"description": "move or rename a file or directory; fails if the destination exists; denied when either end is read-only",
		"inputSchema": {
			"type": "object",
			"properties": {
				"source": { "type": "string", "description": "Source path." },
				"destination": { "type": "string", "description": "Destination path." }
			},
			"required": ["source", "destination"]
		}
	}),
	json!({
		"name": "copy_file",
		"description": "copy a file or directory; fails if the destination exists; copying from read-only directories is allowed",
		"inputSchema": {
			"type": "object",
			"properties": {
				"source": { "type": "string", "description": "Source path." },
				"destination": { "type": "string", "description": "Destination path. Must not be read-only." }
			},
			"required": ["source", "destination"]
		}
	}),
	json!({
		"name": "search_files",
		"description": "recursively find entries whose name matches a case-insensitive glob pattern",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": { "type": "string", "description": "Directory to search from." },
				"pattern": { "type": "string", "description": "Glob matched against entry names." },
				"exclude_patterns": { "type": "array", "items": { "type": "string" }, "description": "Globs to skip." }
			},
			"required": ["path", "pattern"]
		}
	}),
	json!({
		"name": "get_file_info",
		"description": "metadata for a file or directory: size, timestamps, permissions, type",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": { "type": "string", "description": "Path to inspect." }
			},
			"required": ["path"]
		}
	}),
	json!({
		"name": "delete_file",
		"description": "PERMANENTLY delete a file or directory (recursive); blocked in read-only directories and on system paths",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": { "type": "string", "description": "Path to delete." }
			},
			"required": ["path"]
		}
	}),
	json!({
		"name": "list_allowed_directories",
		"description": "list every configured root annotated with its permission tier",
		"inputSchema": {
			"type": "object",
			"properties": {},
			"additionalProperties": false
		}
	})]
}
