//! Browser front end: an axum server rendering the generator page and its JSON API.
//!
//! | Route | |
//! |---|---|
//! | `GET /` | generator page |
//! | `GET /api/presets` | genre presets and the default prompt |
//! | `POST /api/generate` | prompt → stored clip metadata |
//! | `GET /api/audio/{id}` | WAV bytes of a stored clip |
//! | `GET /api/last` | metadata of the last generated clip |
//! | `GET /health`, `GET /ready` | liveness and model readiness |

mod error;
mod generate;
mod health;
mod json;
mod page;
mod router;
mod state;

pub use error::ApiError;
pub use router::create_router;
pub use state::{AppState, ClipStore, StoredClip};
