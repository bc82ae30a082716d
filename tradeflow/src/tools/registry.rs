//! Contract-checked tool registry.
//!
//! Every invocation goes through [`ToolRegistry::call`]: lookup, precondition
//! check, derived-argument override, schema validation, handler execution,
//! output validation, then (and only then) context mutation.

use std::collections::HashMap;

use jsonschema::{Draft, Validator};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::context::ExecutionContext;
use crate::core::descriptor::ToolDescriptor;
use crate::core::path::resolve;
use crate::core::preconditions::check_preconditions;
use crate::error::ToolError;
use crate::tools::handler::ToolHandler;

/// Tool definition advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Structured result of one registry call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Error(ToolError),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }

    pub fn into_result(self) -> Result<Value, ToolError> {
        match self {
            ToolOutcome::Success(value) => Ok(value),
            ToolOutcome::Error(err) => Err(err),
        }
    }

    /// `{status: success, result}` or `{status: error, error: {kind, message}}`,
    /// the shape fed back to the model as a tool message.
    pub fn to_json(&self) -> Value {
        match self {
            ToolOutcome::Success(result) => json!({"status": "success", "result": result}),
            ToolOutcome::Error(err) => json!({
                "status": "error",
                "error": {
                    "kind": err.kind(),
                    "message": err.to_string(),
                    "recoverable": err.is_recoverable(),
                },
            }),
        }
    }
}

struct Entry {
    descriptor: ToolDescriptor,
    handler: Box<dyn ToolHandler>,
    input_schema: Validator,
    output_schema: Option<Validator>,
}

#[derive(Default)]
pub struct ToolRegistry {
    entries: HashMap<String, Entry>,
    order: Vec<String>,
    dry_run: bool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn register(
        &mut self,
        descriptor: ToolDescriptor,
        handler: impl ToolHandler + 'static,
    ) -> Result<(), ToolError> {
        self.register_boxed(descriptor, Box::new(handler))
    }

    /// Register a descriptor/handler pair. Names are unique; descriptors must
    /// validate and their schemas must compile.
    pub fn register_boxed(
        &mut self,
        descriptor: ToolDescriptor,
        handler: Box<dyn ToolHandler>,
    ) -> Result<(), ToolError> {
        let name = descriptor.name.clone();
        if self.entries.contains_key(&name) {
            return Err(ToolError::DuplicateTool(name));
        }
        let errors = descriptor.validate();
        if !errors.is_empty() {
            return Err(ToolError::InvalidDescriptor { tool: name, errors });
        }
        let input_schema = compile(&name, &descriptor.input_schema())?;
        let output_schema = if descriptor.outputs.is_empty() {
            None
        } else {
            Some(compile(&name, &descriptor.output_schema())?)
        };

        debug!(tool = %name, "registered tool");
        self.order.push(name.clone());
        self.entries.insert(
            name,
            Entry {
                descriptor,
                handler,
                input_schema,
                output_schema,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.entries.get(name).map(|entry| &entry.descriptor)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Model-facing schemas for the given tools, in the given order.
    /// Unknown names are skipped.
    pub fn schemas_for<'a>(&self, tools: impl IntoIterator<Item = &'a str>) -> Vec<ToolSchema> {
        tools
            .into_iter()
            .filter_map(|name| self.descriptor(name))
            .map(|descriptor| ToolSchema {
                name: descriptor.name.clone(),
                description: descriptor.model_description(),
                parameters: descriptor.model_parameters(),
            })
            .collect()
    }

    /// Invoke a tool on behalf of the model (or the host).
    ///
    /// On any error the context is left untouched.
    #[instrument(skip_all, fields(tool = %name, phase = %ctx.phase()))]
    pub fn call(&self, name: &str, model_args: &Map<String, Value>, ctx: &mut ExecutionContext) -> ToolOutcome {
        match self.try_call(name, model_args, ctx) {
            Ok(result) => ToolOutcome::Success(result),
            Err(err) => {
                warn!(kind = err.kind(), err = %err, "tool call failed");
                ToolOutcome::Error(err)
            }
        }
    }

    fn try_call(
        &self,
        name: &str,
        model_args: &Map<String, Value>,
        ctx: &mut ExecutionContext,
    ) -> Result<Value, ToolError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let descriptor = &entry.descriptor;

        check_preconditions(descriptor, ctx).map_err(|unmet| ToolError::PreconditionFailed {
            tool: name.to_string(),
            unmet,
        })?;

        let args = resolve_arguments(descriptor, model_args, ctx);
        let errors: Vec<String> = entry
            .input_schema
            .iter_errors(&Value::Object(args.clone()))
            .map(|err| err.to_string())
            .collect();
        if !errors.is_empty() {
            return Err(ToolError::InvalidArguments {
                tool: name.to_string(),
                errors,
            });
        }

        let result = if self.dry_run && descriptor.writes {
            info!("dry run: simulating write tool");
            json!({
                "status": "simulated",
                "dry_run": true,
                "tool": name,
                "arguments": args,
            })
        } else {
            let result = entry
                .handler
                .call(&args)
                .map_err(|error| ToolError::Handler {
                    tool: name.to_string(),
                    error,
                })?;
            if let Some(schema) = &entry.output_schema {
                let errors: Vec<String> = schema
                    .iter_errors(&result)
                    .map(|err| err.to_string())
                    .collect();
                if !errors.is_empty() {
                    return Err(ToolError::InvalidOutput {
                        tool: name.to_string(),
                        errors,
                    });
                }
            }
            result
        };

        ctx.record_call(name);
        for (key, path) in &descriptor.produces {
            match resolve(&result, path) {
                Some(value) => ctx.set(key.clone(), value.clone()),
                None => debug!(key = %key, path = %path, "produced path missing from result"),
            }
        }
        info!(calls = ctx.call_count(name), "tool call succeeded");
        Ok(result)
    }
}

/// Merge model arguments with context-owned values. Every derived input is
/// replaced by the context value, never merged with what the model sent.
pub fn resolve_arguments(
    descriptor: &ToolDescriptor,
    model_args: &Map<String, Value>,
    ctx: &ExecutionContext,
) -> Map<String, Value> {
    let mut args = model_args.clone();
    for (input, path) in &descriptor.dependencies.derived_inputs {
        match ctx.get(path) {
            Some(value) => {
                args.insert(input.clone(), value.clone());
            }
            None => {
                args.remove(input);
            }
        }
    }
    args
}

fn compile(tool: &str, schema: &Value) -> Result<Validator, ToolError> {
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .map_err(|err| ToolError::InvalidDescriptor {
            tool: tool.to_string(),
            errors: vec![format!("schema does not compile: {err}")],
        })
}
