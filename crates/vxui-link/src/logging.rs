use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber for embedders that do not bring their
/// own. `debug` widens the default filter for this crate's targets;
/// `VXUI_LOG` overrides everything.
pub fn init(debug: bool) {
    let default = if debug { "vxui_link=debug" } else { "vxui_link=info" };
    let filter = EnvFilter::try_from_env("VXUI_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
