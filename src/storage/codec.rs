//! Loader call codec
//!
//! Module payloads travel (and are cached) as source text of loader calls:
//!
//! ```text
//! mw.loader.implement("<name>@<version>", <script>, <style>, <messages>, <templates>);
//! mw.loader.state({"<name>": "<state>"});
//! ```
//!
//! Every argument is JSON. Functions are carried as `{"function": "<source>"}`
//! and turned back into callables by the host.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::module::script::{
    Implementation, Messages, ModuleFunction, ModuleScript, PackageFile, StylePayload, Templates,
};
use crate::module::traits::{ModuleState, ScriptHost};

const IMPLEMENT_CALL: &str = "mw.loader.implement(";
const STATE_CALL: &str = "mw.loader.state(";

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEnd(usize),

    #[error("unexpected {found:?} at offset {offset}")]
    Unexpected { found: char, offset: usize },

    #[error("unknown loader call at offset {0}")]
    UnknownCall(usize),

    #[error("{call} takes {expected} arguments, got {count}")]
    Arity {
        call: &'static str,
        expected: &'static str,
        count: usize,
    },

    #[error("invalid argument {index} at offset {offset}: {source}")]
    InvalidArgument {
        index: usize,
        offset: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("function in {0} has no source text")]
    UnencodableFunction(String),

    #[error("failed to compile function: {0}")]
    Compile(String),

    #[error("failed to encode payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialized script shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EncodedScript {
    Urls(Vec<String>),
    Source(String),
    Function {
        function: String,
    },
    Package {
        main: String,
        files: IndexMap<String, EncodedFile>,
    },
}

/// Serialized package file, `{"function": "<source>"}` or `{"data": <json>}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodedFile {
    Function(String),
    Data(Value),
}

/// An implement call with its payload still in serialized form
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImplementation {
    pub script: Option<EncodedScript>,
    pub style: Option<StylePayload>,
    pub messages: Option<Messages>,
    pub templates: Option<Templates>,
}

impl EncodedImplementation {
    /// Compile function sources through the host
    pub fn into_implementation(self, host: &dyn ScriptHost) -> Result<Implementation, CodecError> {
        let compile = |source: &str| {
            host.compile(source)
                .map_err(|e| CodecError::Compile(format!("{:#}", e)))
        };
        let script = match self.script {
            None => None,
            Some(EncodedScript::Urls(urls)) => Some(ModuleScript::Urls(urls)),
            Some(EncodedScript::Source(source)) => Some(ModuleScript::Source(source)),
            Some(EncodedScript::Function { function }) => {
                Some(ModuleScript::Function(compile(&function)?))
            }
            Some(EncodedScript::Package { main, files }) => {
                let mut decoded = IndexMap::with_capacity(files.len());
                for (name, file) in files {
                    let file = match file {
                        EncodedFile::Function(function) => {
                            PackageFile::Function(compile(&function)?)
                        }
                        EncodedFile::Data(value) => PackageFile::Data(value),
                    };
                    decoded.insert(name, file);
                }
                Some(ModuleScript::Package {
                    main,
                    files: decoded,
                })
            }
        };
        Ok(Implementation {
            script,
            style: self.style,
            messages: self.messages,
            templates: self.templates,
        })
    }
}

/// One parsed loader call
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderCall {
    Implement {
        key: String,
        implementation: EncodedImplementation,
    },
    State(IndexMap<String, ModuleState>),
}

fn function_source(function: &ModuleFunction, key: &str) -> Result<String, CodecError> {
    function
        .source()
        .map(str::to_string)
        .ok_or_else(|| CodecError::UnencodableFunction(key.to_string()))
}

fn encode_script(script: &ModuleScript, key: &str) -> Result<EncodedScript, CodecError> {
    Ok(match script {
        ModuleScript::Urls(urls) => EncodedScript::Urls(urls.clone()),
        ModuleScript::Source(source) => EncodedScript::Source(source.clone()),
        ModuleScript::Function(function) => EncodedScript::Function {
            function: function_source(function, key)?,
        },
        ModuleScript::Package { main, files } => {
            let mut encoded = IndexMap::with_capacity(files.len());
            for (name, file) in files {
                let file = match file {
                    PackageFile::Function(function) => {
                        EncodedFile::Function(function_source(function, key)?)
                    }
                    PackageFile::Data(value) => EncodedFile::Data(value.clone()),
                };
                encoded.insert(name.clone(), file);
            }
            EncodedScript::Package {
                main: main.clone(),
                files: encoded,
            }
        }
    })
}

/// Encode a payload as an implement call
pub fn encode_implement(key: &str, implementation: &Implementation) -> Result<String, CodecError> {
    let script = implementation
        .script
        .as_ref()
        .map(|s| encode_script(s, key))
        .transpose()?;
    let args = [
        serde_json::to_string(key)?,
        serde_json::to_string(&script)?,
        serde_json::to_string(&implementation.style)?,
        serde_json::to_string(&implementation.messages)?,
        serde_json::to_string(&implementation.templates)?,
    ];
    Ok(format!("{}{});", IMPLEMENT_CALL, args.join(",")))
}

/// Encode a state call
pub fn encode_state(states: &IndexMap<String, ModuleState>) -> Result<String, CodecError> {
    Ok(format!("{}{});", STATE_CALL, serde_json::to_string(states)?))
}

/// Parse a sequence of loader calls
pub fn parse_calls(text: &str) -> Result<Vec<LoaderCall>, CodecError> {
    let mut calls = Vec::new();
    let mut pos = 0;
    loop {
        pos = skip_separators(text, pos);
        if pos >= text.len() {
            break;
        }
        let rest = &text[pos..];
        if rest.starts_with(IMPLEMENT_CALL) {
            let (args, end) = split_arguments(text, pos + IMPLEMENT_CALL.len())?;
            calls.push(parse_implement(&args)?);
            pos = end;
        } else if rest.starts_with(STATE_CALL) {
            let (args, end) = split_arguments(text, pos + STATE_CALL.len())?;
            calls.push(parse_state(&args)?);
            pos = end;
        } else {
            return Err(CodecError::UnknownCall(pos));
        }
    }
    Ok(calls)
}

fn skip_separators(text: &str, mut pos: usize) -> usize {
    let bytes = text.as_bytes();
    while pos < bytes.len() && (bytes[pos].is_ascii_whitespace() || bytes[pos] == b';') {
        pos += 1;
    }
    pos
}

/// Argument text with its offset in the input
struct Argument<'a> {
    text: &'a str,
    offset: usize,
}

/// Split top-level call arguments starting just after `(`.
///
/// Returns the arguments and the offset just after the closing `)`.
fn split_arguments(text: &str, start: usize) -> Result<(Vec<Argument<'_>>, usize), CodecError> {
    let bytes = text.as_bytes();
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut arg_start = start;
    let mut pos = start;

    while pos < bytes.len() {
        let b = bytes[pos];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            pos += 1;
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' | b'{' => depth += 1,
            b']' | b'}' => {
                if depth == 0 {
                    return Err(CodecError::Unexpected {
                        found: b as char,
                        offset: pos,
                    });
                }
                depth -= 1;
            }
            b',' if depth == 0 => {
                args.push(Argument {
                    text: &text[arg_start..pos],
                    offset: arg_start,
                });
                arg_start = pos + 1;
            }
            b')' if depth == 0 => {
                let last = &text[arg_start..pos];
                if !args.is_empty() || !last.trim().is_empty() {
                    args.push(Argument {
                        text: last,
                        offset: arg_start,
                    });
                }
                return Ok((args, pos + 1));
            }
            _ => {}
        }
        pos += 1;
    }
    Err(CodecError::UnexpectedEnd(text.len()))
}

fn parse_arg<'de, T: Deserialize<'de>>(
    args: &[Argument<'de>],
    index: usize,
) -> Result<Option<T>, CodecError> {
    match args.get(index) {
        None => Ok(None),
        Some(arg) => serde_json::from_str::<Option<T>>(arg.text).map_err(|source| {
            CodecError::InvalidArgument {
                index,
                offset: arg.offset,
                source,
            }
        }),
    }
}

fn parse_implement(args: &[Argument<'_>]) -> Result<LoaderCall, CodecError> {
    if args.is_empty() || args.len() > 5 {
        return Err(CodecError::Arity {
            call: "implement",
            expected: "1 to 5",
            count: args.len(),
        });
    }
    let key: String = match parse_arg(args, 0)? {
        Some(key) => key,
        None => {
            return Err(CodecError::Arity {
                call: "implement",
                expected: "a module key and up to 4",
                count: args.len(),
            })
        }
    };
    Ok(LoaderCall::Implement {
        key,
        implementation: EncodedImplementation {
            script: parse_arg(args, 1)?,
            style: parse_arg(args, 2)?,
            messages: parse_arg(args, 3)?,
            templates: parse_arg(args, 4)?,
        },
    })
}

fn parse_state(args: &[Argument<'_>]) -> Result<LoaderCall, CodecError> {
    if args.len() != 1 {
        return Err(CodecError::Arity {
            call: "state",
            expected: "1",
            count: args.len(),
        });
    }
    let states: IndexMap<String, ModuleState> = parse_arg(args, 0)?.unwrap_or_default();
    Ok(LoaderCall::State(states))
}
