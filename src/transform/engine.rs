use parking_lot::Mutex;
use rhai::packages::{
    BasicArrayPackage, BasicMapPackage, BasicMathPackage, CorePackage, LogicPackage,
    MoreStringPackage, Package,
};
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Scope, AST};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{SandboxConfig, Transformation};
use crate::error::TransformError;
use crate::transform::message::Emit;
use crate::transform::{discover_destinations, EMIT_PREFIX};
use crate::types::{ChangeEvent, MutationKind, OutboundMessage};

/// Name of the function wrapping the user script.
const ENTRY_POINT: &str = "__queue_etl_transform";

const METADATA: &str = "@metadata";
const METADATA_ID: &str = "@id";
const METADATA_COLLECTION: &str = "@collection";

type Outbox = Arc<Mutex<Vec<Emit>>>;

/// Compiled transformation script bound to its sandbox.
pub struct TransformEngine {
    transform: Transformation,
    engine: Engine,
    ast: AST,
    outbox: Outbox,
}

impl std::fmt::Debug for TransformEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformEngine")
            .field("transform", &self.transform.name)
            .finish()
    }
}

impl TransformEngine {
    pub fn compile(
        transform: &Transformation,
        sandbox: &SandboxConfig,
    ) -> Result<Self, TransformError> {
        let outbox: Outbox = Arc::new(Mutex::new(Vec::new()));
        let mut engine = sandboxed_engine(&transform.name, sandbox);

        for destination in discover_destinations(&transform.script) {
            register_destination(
                &mut engine,
                destination,
                outbox.clone(),
                sandbox.max_messages_per_run,
            );
        }
        register_generic_emit(&mut engine, outbox.clone(), sandbox.max_messages_per_run);

        // Top-level statements run inside the entry point so they can use
        // `this`; helper functions stay at global level.
        let (statements, functions) = hoist_functions(&transform.script);
        let source = format!("fn {ENTRY_POINT}() {{ {statements}\n}}\n{functions}");
        let ast = engine
            .compile(&source)
            .map_err(|e| TransformError::Compile {
                transform: transform.name.clone(),
                message: e.to_string(),
            })?;

        debug!("Compiled transformation '{}'", transform.name);

        Ok(Self {
            transform: transform.clone(),
            engine,
            ast,
            outbox,
        })
    }

    pub fn name(&self) -> &str {
        &self.transform.name
    }

    pub fn applies_to(&self, collection: &str) -> bool {
        !self.transform.disabled && self.transform.applies_to(collection)
    }

    /// Runs the script against one change. Messages are returned in emit
    /// order; a failing run returns no messages at all.
    pub fn run(&self, event: &ChangeEvent) -> Result<Vec<OutboundMessage>, TransformError> {
        let snapshot = match (event.mutation, &event.snapshot) {
            (MutationKind::Put, Some(snapshot)) => snapshot,
            _ => return Ok(Vec::new()),
        };

        let runtime_error = |message: String| TransformError::Runtime {
            transform: self.transform.name.clone(),
            document_id: event.document_id.clone(),
            message,
        };

        let document = with_metadata(snapshot, event).map_err(runtime_error)?;
        let mut this = rhai::serde::to_dynamic(&document).map_err(|e| runtime_error(e.to_string()))?;

        self.outbox.lock().clear();

        let options = CallFnOptions::new()
            .eval_ast(false)
            .rewind_scope(true)
            .bind_this_ptr(&mut this);
        let mut scope = Scope::new();
        let outcome =
            self.engine
                .call_fn_with_options::<Dynamic>(options, &mut scope, &self.ast, ENTRY_POINT, ());

        let emitted = std::mem::take(&mut *self.outbox.lock());
        if let Err(e) = outcome {
            return Err(runtime_error(e.to_string()));
        }

        emitted
            .into_iter()
            .map(|emit| emit.into_message(&self.transform.name, event))
            .collect()
    }
}

/// Splits a script into its top-level statements and its top-level `fn`
/// definitions. Each removed definition is replaced by the newlines it
/// spanned, so the statements keep their line numbers.
fn hoist_functions(script: &str) -> (String, String) {
    let bytes = script.as_bytes();
    let mut statements = String::with_capacity(script.len());
    let mut functions = String::new();
    let mut copied = 0;
    let mut depth = 0usize;
    let mut definition: Option<usize> = None;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = skip_until(bytes, i + 2, b"\n");
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = skip_until(bytes, i + 2, b"*/");
                continue;
            }
            quote @ (b'"' | b'\'' | b'`') => {
                i = skip_literal(bytes, i + 1, quote);
                continue;
            }
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(start) = definition.take() {
                        let end = i + 1;
                        statements.push_str(&script[copied..start]);
                        statements.extend(script[start..end].matches('\n'));
                        functions.push_str(&script[start..end]);
                        functions.push('\n');
                        copied = end;
                    }
                }
            }
            _ if depth == 0 && definition.is_none() => {
                if keyword_at(bytes, i, "fn") {
                    definition = Some(i);
                } else if keyword_at(bytes, i, "private") {
                    let next = i + "private".len();
                    let after = next + bytes[next..].iter().take_while(|b| b.is_ascii_whitespace()).count();
                    if keyword_at(bytes, after, "fn") {
                        definition = Some(i);
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    statements.push_str(&script[copied..]);
    (statements, functions)
}

fn keyword_at(bytes: &[u8], at: usize, keyword: &str) -> bool {
    let is_ident = |b: &u8| b.is_ascii_alphanumeric() || *b == b'_';
    bytes[at..].starts_with(keyword.as_bytes())
        && (at == 0 || !is_ident(&bytes[at - 1]))
        && bytes.get(at + keyword.len()).map_or(true, |b| !is_ident(b))
}

/// Index just past the next `end` marker, or the end of input.
fn skip_until(bytes: &[u8], from: usize, end: &[u8]) -> usize {
    (from..bytes.len())
        .find(|&i| bytes[i..].starts_with(end))
        .map_or(bytes.len(), |i| i + end.len())
}

/// Index just past the closing `quote`, honouring backslash escapes.
fn skip_literal(bytes: &[u8], from: usize, quote: u8) -> usize {
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if quote != b'`' => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn sandboxed_engine(transform: &str, sandbox: &SandboxConfig) -> Engine {
    // Raw engine: only pure data packages, no time, no file or network access.
    let mut engine = Engine::new_raw();
    engine.register_global_module(CorePackage::new().as_shared_module());
    engine.register_global_module(LogicPackage::new().as_shared_module());
    engine.register_global_module(BasicMathPackage::new().as_shared_module());
    engine.register_global_module(BasicArrayPackage::new().as_shared_module());
    engine.register_global_module(BasicMapPackage::new().as_shared_module());
    engine.register_global_module(MoreStringPackage::new().as_shared_module());

    engine.disable_symbol("eval");
    engine.disable_symbol("sleep");

    engine.set_max_operations(sandbox.max_operations);
    engine.set_max_call_levels(sandbox.max_call_levels);
    engine.set_max_expr_depths(sandbox.max_expr_depth, sandbox.max_expr_depth);
    engine.set_max_string_size(sandbox.max_string_size);
    engine.set_max_array_size(sandbox.max_array_size);
    engine.set_max_map_size(sandbox.max_map_size);

    let name = transform.to_string();
    engine.on_print(move |text| debug!(transform = %name, "{}", text));
    let name = transform.to_string();
    engine.on_debug(move |text, _source, position| {
        debug!(transform = %name, %position, "{}", text)
    });

    engine.register_fn("id", document_id);
    engine
}

fn document_id(document: Map) -> Result<ImmutableString, Box<EvalAltResult>> {
    document
        .get(METADATA)
        .and_then(|metadata| metadata.clone().try_cast::<Map>())
        .and_then(|metadata| metadata.get(METADATA_ID).cloned())
        .and_then(|id| id.into_immutable_string().ok())
        .ok_or_else(|| "id() expects a document with @metadata.@id".into())
}

fn with_metadata(
    snapshot: &serde_json::Value,
    event: &ChangeEvent,
) -> Result<serde_json::Value, String> {
    let mut document = match snapshot {
        serde_json::Value::Object(fields) => fields.clone(),
        other => {
            return Err(format!(
                "document snapshot must be an object, got {}",
                json_kind(other)
            ))
        }
    };

    let metadata = document
        .entry(METADATA.to_string())
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    if let serde_json::Value::Object(metadata) = metadata {
        metadata.insert(
            METADATA_ID.to_string(),
            serde_json::Value::String(event.document_id.clone()),
        );
        metadata.insert(
            METADATA_COLLECTION.to_string(),
            serde_json::Value::String(event.collection.clone()),
        );
    } else {
        return Err(format!("{METADATA} must be an object"));
    }

    Ok(serde_json::Value::Object(document))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn record(
    outbox: &Outbox,
    limit: usize,
    destination: &str,
    payload: Dynamic,
    routing_key: Option<ImmutableString>,
    attributes: Map,
) -> Result<(), Box<EvalAltResult>> {
    if destination.is_empty() {
        return Err("loadTo requires a destination name".into());
    }

    let mut emitted = outbox.lock();
    if emitted.len() >= limit {
        warn!("Emit limit of {} messages reached", limit);
        return Err(format!("a single run may emit at most {limit} messages").into());
    }

    emitted.push(Emit {
        destination: destination.to_string(),
        payload,
        routing_key: routing_key.map(|key| key.to_string()),
        attributes,
    });
    Ok(())
}

/// Registers `loadTo<destination>` with its four call shapes.
fn register_destination(engine: &mut Engine, destination: String, outbox: Outbox, limit: usize) {
    let function = format!("{EMIT_PREFIX}{destination}");
    let destination: Arc<str> = Arc::from(destination);

    let (target, sink) = (destination.clone(), outbox.clone());
    engine.register_fn(function.as_str(), move |payload: Dynamic| {
        record(&sink, limit, &target, payload, None, Map::new())
    });

    let (target, sink) = (destination.clone(), outbox.clone());
    engine.register_fn(function.as_str(), move |payload: Dynamic, attributes: Map| {
        record(&sink, limit, &target, payload, None, attributes)
    });

    let (target, sink) = (destination.clone(), outbox.clone());
    engine.register_fn(
        function.as_str(),
        move |payload: Dynamic, routing_key: ImmutableString| {
            record(&sink, limit, &target, payload, Some(routing_key), Map::new())
        },
    );

    let (target, sink) = (destination, outbox);
    engine.register_fn(
        function.as_str(),
        move |payload: Dynamic, routing_key: ImmutableString, attributes: Map| {
            record(&sink, limit, &target, payload, Some(routing_key), attributes)
        },
    );
}

/// Registers `loadTo(name, ...)` for destinations chosen at run time.
fn register_generic_emit(engine: &mut Engine, outbox: Outbox, limit: usize) {
    let sink = outbox.clone();
    engine.register_fn(EMIT_PREFIX, move |name: ImmutableString, payload: Dynamic| {
        record(&sink, limit, name.as_str(), payload, None, Map::new())
    });

    let sink = outbox.clone();
    engine.register_fn(
        EMIT_PREFIX,
        move |name: ImmutableString, payload: Dynamic, attributes: Map| {
            record(&sink, limit, name.as_str(), payload, None, attributes)
        },
    );

    let sink = outbox.clone();
    engine.register_fn(
        EMIT_PREFIX,
        move |name: ImmutableString, payload: Dynamic, routing_key: ImmutableString| {
            record(&sink, limit, name.as_str(), payload, Some(routing_key), Map::new())
        },
    );

    let sink = outbox;
    engine.register_fn(
        EMIT_PREFIX,
        move |name: ImmutableString,
              payload: Dynamic,
              routing_key: ImmutableString,
              attributes: Map| {
            record(&sink, limit, name.as_str(), payload, Some(routing_key), attributes)
        },
    );
}
