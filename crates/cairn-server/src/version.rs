//! Build metadata captured by `build.rs`

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short git commit SHA
pub const GIT_SHA: &str = or_unknown(option_env!("VERGEN_GIT_SHA"));

pub const GIT_COMMIT_TIMESTAMP: &str = or_unknown(option_env!("VERGEN_GIT_COMMIT_TIMESTAMP"));

pub const GIT_BRANCH: &str = or_unknown(option_env!("VERGEN_GIT_BRANCH"));

/// `"true"` if the working tree had uncommitted changes
pub const GIT_DIRTY: &str = match option_env!("VERGEN_GIT_DIRTY") {
    Some(dirty) => dirty,
    None => "false",
};

pub const RUSTC_VERSION: &str = or_unknown(option_env!("VERGEN_RUSTC_SEMVER"));

pub const BUILD_TIMESTAMP: &str = or_unknown(option_env!("VERGEN_BUILD_TIMESTAMP"));

pub const TARGET: &str = or_unknown(option_env!("VERGEN_CARGO_TARGET_TRIPLE"));

const fn or_unknown(value: Option<&'static str>) -> &'static str {
    match value {
        Some(value) => value,
        None => "unknown",
    }
}

/// `<version> (<git_sha>[ dirty])`
pub fn full_version() -> String {
    let dirty = if GIT_DIRTY == "true" { " dirty" } else { "" };
    format!("{VERSION} ({GIT_SHA}{dirty})")
}

/// Multi-line build report printed by `cairn-server version`
pub fn build_info() -> String {
    format!(
        "cairn-server {}\n\
         commit: {} ({})\n\
         branch: {}\n\
         built:  {}\n\
         rustc:  {}\n\
         target: {}",
        VERSION, GIT_SHA, GIT_COMMIT_TIMESTAMP, GIT_BRANCH, BUILD_TIMESTAMP, RUSTC_VERSION, TARGET
    )
}
