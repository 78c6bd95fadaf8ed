//! ConnectionManager has no bespoke behavior: this renderer doesn't model
//! dynamic connection setup, so every action's declared outputs are just
//! the seeded registry constants echoed back by the default handler.

use std::collections::HashMap;

use super::HandlerResult;
use crate::state::AppStateInner;

pub fn handle(_action: &str, _args: &HashMap<String, String>, _state: &AppStateInner) -> Option<HandlerResult> {
    None
}
