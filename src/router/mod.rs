//! Request routing — the (path template, method) → endpoint table.
//!
//! Two tiers: templates that reduce to a single literal live in an exact
//! map keyed by (lowercased path, method); everything else is a tokenized
//! entry matched in insertion order, first match wins. The router is built
//! once before the server starts and is immutable while it runs.

use std::collections::HashMap;

use crate::error::ServiceError;
use crate::handler::RouteHandler;
use crate::http::Method;
use crate::operation::OperationId;
use crate::path::{PathShape, PathTemplate, TemplateError};

struct ExactEntry {
    id: OperationId,
    handler: RouteHandler,
}

struct TokenizedEntry {
    id: OperationId,
    template: PathTemplate,
    method: Method,
    handler: RouteHandler,
}

/// What the router selected for a request.
pub struct Selection {
    pub handler: RouteHandler,
    pub id: OperationId,
    pub shape: PathShape,
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .finish()
    }
}

/// The handler-selection table.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use opserve::http::Method;
/// use opserve::operation::OperationId;
/// use opserve::router::Router;
///
/// let mut router = Router::new();
/// let handler: opserve::handler::RouteHandler =
///     Arc::new(|_req, _writer, _ctx| Box::pin(async { Ok(()) }));
/// router
///     .add_handler(
///         OperationId::new("GetItem", "/items/{id}"),
///         Method::Get,
///         handler,
///     )
///     .unwrap();
///
/// let selection = router.select_handler("/items/abc", &Method::Get).unwrap();
/// assert_eq!(selection.shape.get("id"), Some("abc"));
/// ```
#[derive(Default)]
pub struct Router {
    exact: HashMap<(String, Method), ExactEntry>,
    tokenized: Vec<TokenizedEntry>,
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint under the identifier's path template.
    ///
    /// Re-registering the same (identifier, method) pair replaces the prior
    /// entry. An untokenizable template fails registration.
    pub fn add_handler(
        &mut self,
        id: OperationId,
        method: Method,
        handler: RouteHandler,
    ) -> Result<(), TemplateError> {
        let template = PathTemplate::parse(id.path())?;

        match template.exact_key() {
            Some(key) => {
                self.exact.insert((key, method), ExactEntry { id, handler });
            }
            None => {
                let entry = TokenizedEntry {
                    id,
                    template,
                    method,
                    handler,
                };
                // Same (identifier, method) replaces in place, keeping the
                // original position in the match order.
                match self
                    .tokenized
                    .iter_mut()
                    .find(|e| e.id == entry.id && e.method == entry.method)
                {
                    Some(existing) => *existing = entry,
                    None => self.tokenized.push(entry),
                }
            }
        }
        Ok(())
    }

    /// Total number of registered entries.
    pub fn len(&self) -> usize {
        self.exact.len() + self.tokenized.len()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.tokenized.is_empty()
    }

    /// Selects the endpoint for `(path, method)`.
    ///
    /// The exact map is consulted first on the lowercased path; on a miss,
    /// tokenized entries are tried in insertion order and the first whose
    /// method and template both match wins. A template that fails to match
    /// only means iteration continues.
    pub fn select_handler(&self, path: &str, method: &Method) -> Result<Selection, ServiceError> {
        let normalized = normalize(path);

        if let Some(entry) = self
            .exact
            .get(&(normalized.to_ascii_lowercase(), method.clone()))
        {
            return Ok(Selection {
                handler: entry.handler.clone(),
                id: entry.id.clone(),
                shape: PathShape::new(),
            });
        }

        for entry in &self.tokenized {
            if &entry.method != method {
                continue;
            }
            if let Some(shape) = entry.template.match_path(normalized) {
                return Ok(Selection {
                    handler: entry.handler.clone(),
                    id: entry.id.clone(),
                    shape,
                });
            }
        }

        Err(ServiceError::InvalidOperation {
            path: path.to_owned(),
            method: method.clone(),
        })
    }
}

/// Strips trailing slashes so `/users/` and `/users` select the same entry.
fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}
