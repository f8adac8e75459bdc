#![forbid(unsafe_code)]
#![doc = r#"
Cotrelay

Augment OpenAI-compatible chat completion requests with a synthesized
chain-of-thought block and relay them to a primary inference backend, or to
a fallback provider when the primary fails its health probe.

Crate highlights
- CoT caching policy: regeneration is gated on a per-message rotation
  window tracked in shared process state.
- Liveness-gated routing: a bounded health probe decides primary vs
  fallback; fallback models rotate round robin.
- Streaming relay with an explicit cancellation context (caller disconnect
  plus a post-flush force abort).

Modules
- `config`: Settings loaded once from YAML plus env overrides.
- `models`: Wire types, inline per-request overrides, provider shapes.
- `tracker`: Serialized-access rotation and cache state.
- `liveness` / `cot` / `augment` / `fallback` / `relay`: the request
  pipeline, in order.
- `audit`: CoT/chat persistence behind an async trait.
- `server`: Actix router and handlers (the binary uses this).
- `util`: Shared helpers (tracing, env, AppState).
"#]

pub mod audit;
pub mod augment;
pub mod config;
pub mod cot;
pub mod fallback;
pub mod liveness;
pub mod models;
pub mod relay;
pub mod server;
pub mod tracker;
pub mod util;

// Re-export the pipeline surface for ergonomic library use.
pub use crate::audit::{AuditStore, ChatRecord, JsonlAuditStore, MemoryAuditStore, ThoughtRecord};
pub use crate::augment::augment_messages;
pub use crate::config::{Handler, Settings};
pub use crate::cot::{ensure_chain_of_thought, CotError};
pub use crate::fallback::{choose_route, reshape_request, resolve_handler, Route, RouteError};
pub use crate::models::{CompletionRequest, ExtensionSettings, Message, ProviderRequest, Role};
pub use crate::relay::RelayCancellation;
pub use crate::tracker::Tracker;
