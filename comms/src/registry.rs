//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! Service registry with overload resolution.
//!
//! Methods are registered under their name plus a parameter shape, and
//! resolved lazily against the shapes of the actual arguments. An exact shape
//! beats [`ParamType::Any`]; two candidates matching equally well is an
//! ambiguity error rather than an arbitrary pick.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, RwLock},
};

use futures::future::BoxFuture;
use log::*;

use crate::{
    framing::{InboundStream, OutboundStream},
    message::{ErrorDescriptor, RemoteErrorKind, RpcValue, ValueShape},
};

const LOG_TARGET: &str = "comms::registry";

/// Declared parameter type of a registered method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// Matches any argument shape, at lower precedence than an exact match.
    Any,
    Bool,
    Int,
    Double,
    Decimal,
    Str,
    Bytes,
    List,
    Map,
    Stream,
}

impl ParamType {
    fn match_score(&self, shape: ValueShape) -> Option<u32> {
        match (self, shape) {
            (ParamType::Any, _) => Some(1),
            (ParamType::Bool, ValueShape::Bool) |
            (ParamType::Int, ValueShape::Int) |
            (ParamType::Double, ValueShape::Double) |
            (ParamType::Decimal, ValueShape::Decimal) |
            (ParamType::Str, ValueShape::Str) |
            (ParamType::Bytes, ValueShape::Bytes) |
            (ParamType::List, ValueShape::List) |
            (ParamType::Map, ValueShape::Map) |
            (ParamType::Stream, ValueShape::Stream) => Some(2),
            // Null is accepted anywhere a value is expected
            (_, ValueShape::Null) => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::Any => "any",
            ParamType::Bool => "bool",
            ParamType::Int => "int",
            ParamType::Double => "double",
            ParamType::Decimal => "decimal",
            ParamType::Str => "str",
            ParamType::Bytes => "bytes",
            ParamType::List => "list",
            ParamType::Map => "map",
            ParamType::Stream => "stream",
        };
        write!(f, "{}", name)
    }
}

/// What a handler receives: the resolved method name, argument values and
/// lazily streamed request attachments.
pub struct ServiceRequest {
    pub method: String,
    pub args: Vec<RpcValue>,
    pub streams: Vec<InboundStream>,
}

/// What a handler returns: a result value plus any response-direction
/// streams.
pub struct ServiceResponse {
    pub value: RpcValue,
    pub streams: Vec<OutboundStream>,
}

impl ServiceResponse {
    pub fn value(value: RpcValue) -> Self {
        Self {
            value,
            streams: Vec::new(),
        }
    }

    pub fn with_stream(mut self, stream: OutboundStream) -> Self {
        self.streams.push(stream);
        self
    }
}

/// A user-level handler failure. The message travels to the caller verbatim;
/// `detail` carries diagnostic context such as a stack description.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct InvocationError {
    pub message: String,
    pub detail: Option<String>,
}

impl InvocationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

type HandlerFn =
    Box<dyn Fn(ServiceRequest) -> BoxFuture<'static, Result<ServiceResponse, InvocationError>> + Send + Sync>;

pub struct MethodDef {
    service: String,
    name: String,
    params: Vec<ParamType>,
    handler: HandlerFn,
}

impl std::fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDef")
            .field("service", &self.service)
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl MethodDef {
    pub fn signature(&self) -> String {
        let params = self
            .params
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}.{}({})", self.service, self.name, params)
    }

    pub async fn invoke(&self, request: ServiceRequest) -> Result<ServiceResponse, InvocationError> {
        (self.handler)(request).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("'{service}.{method}'")]
    NotFound { service: String, method: String },
    #[error("Ambiguous call to {call}; candidates: {candidates}")]
    Ambiguous { call: String, candidates: String },
}

impl ResolveError {
    pub(crate) fn to_descriptor(&self) -> ErrorDescriptor {
        match self {
            ResolveError::NotFound { service, method } => ErrorDescriptor {
                kind: RemoteErrorKind::ServiceNotFound,
                message: format!("'{}.{}'", service, method),
                detail: None,
            },
            ResolveError::Ambiguous { .. } => ErrorDescriptor {
                kind: RemoteErrorKind::AmbiguousMethod,
                message: self.to_string(),
                detail: None,
            },
        }
    }
}

/// Maps service names to method tables. Registration happens at startup;
/// resolution takes a read lock only.
#[derive(Default)]
pub struct Registry {
    services: RwLock<HashMap<String, Vec<Arc<MethodDef>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a method overload. Overloads of the same name are told apart
    /// by arity and parameter shape at resolution time.
    pub fn register<F, Fut>(&self, service: &str, method: &str, params: Vec<ParamType>, handler: F)
    where
        F: Fn(ServiceRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ServiceResponse, InvocationError>> + Send + 'static,
    {
        let def = Arc::new(MethodDef {
            service: service.to_string(),
            name: method.to_string(),
            params,
            handler: Box::new(move |request| -> BoxFuture<'static, Result<ServiceResponse, InvocationError>> {
                Box::pin(handler(request))
            }),
        });
        debug!(target: LOG_TARGET, "registered {}", def.signature());
        self.services
            .write()
            .unwrap()
            .entry(service.to_string())
            .or_default()
            .push(def);
    }

    /// Resolve a method against the shapes of the actual arguments.
    pub fn resolve(
        &self,
        service: &str,
        method: &str,
        shapes: &[ValueShape],
    ) -> Result<Arc<MethodDef>, ResolveError> {
        let not_found = || ResolveError::NotFound {
            service: service.to_string(),
            method: method.to_string(),
        };

        let lock = self.services.read().unwrap();
        let methods = lock.get(service).ok_or_else(not_found)?;

        let mut best_score = 0u32;
        let mut best: Vec<&Arc<MethodDef>> = Vec::new();
        for def in methods.iter().filter(|def| def.name == method) {
            if def.params.len() != shapes.len() {
                continue;
            }
            let mut score = 0u32;
            let mut matched = true;
            for (param, shape) in def.params.iter().zip(shapes) {
                match param.match_score(*shape) {
                    Some(s) => score += s,
                    None => {
                        matched = false;
                        break;
                    },
                }
            }
            if !matched {
                continue;
            }
            // Zero-arity methods match with score 0
            let score = score.max(1);
            if score > best_score {
                best_score = score;
                best.clear();
                best.push(def);
            } else if score == best_score {
                best.push(def);
            }
        }

        match best.len() {
            0 => Err(not_found()),
            1 => Ok(best[0].clone()),
            _ => {
                let shapes_desc = shapes
                    .iter()
                    .map(|s| format!("{:?}", s).to_lowercase())
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(ResolveError::Ambiguous {
                    call: format!("{}.{}({})", service, method, shapes_desc),
                    candidates: best
                        .iter()
                        .map(|def| def.signature())
                        .collect::<Vec<_>>()
                        .join("; "),
                })
            },
        }
    }
}
