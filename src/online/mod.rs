//! Online inference: a command protocol driving incremental model changes
//! and re-optimization over an [`OnlineTermStore`](crate::term::online::OnlineTermStore).

pub mod action;
pub mod inference;

pub use action::OnlineAction;
pub use inference::{OnlineInference, OnlineResponse, SessionEnd};
