//! Tab identity
//!
//! One random identity per context, generated lazily and cached for the
//! process lifetime. The only sanctioned process-wide singleton in the
//! subsystem; everything else is owned by an explicit instance.

use std::sync::OnceLock;

use portside_protocol::TabId;

static TAB_ID: OnceLock<TabId> = OnceLock::new();

/// The identity of the current context. The first call generates it;
/// every later call returns the same value.
pub fn tab_id() -> &'static TabId {
    TAB_ID.get_or_init(TabId::generate)
}
