use common::eyre::Result;

/// Setup error reporting
///
/// Installs the `color-eyre` report hook with the noisy sections off in
/// release builds; set `RUST_BACKTRACE=1`/`RUST_SPANTRACE=1` to get them
/// back when debugging.
pub fn setup() -> Result<()> {
    let development = cfg!(debug_assertions);

    let builder = color_eyre::config::HookBuilder::default()
        .display_location_section(development)
        .display_env_section(development);

    if !development && std::env::var_os("RUST_SPANTRACE").is_none() {
        std::env::set_var("RUST_SPANTRACE", "0");
    }

    builder.install()?;

    Ok(())
}
