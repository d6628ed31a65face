//! User-Agent rendering.
//!
//! The configured template may contain `%s`, which is replaced with the crate
//! version so servers can tell client releases apart.

/// Default User-Agent template.
pub const DEFAULT_USER_AGENT_TEMPLATE: &str = "pkgfetch/%s";

/// Renders a User-Agent template.
#[must_use]
pub fn render(template: &str) -> String {
    template.replace("%s", env!("CARGO_PKG_VERSION"))
}

/// The User-Agent used when none is configured.
#[must_use]
pub fn default_user_agent() -> String {
    render(DEFAULT_USER_AGENT_TEMPLATE)
}
