/// Capture point for errors a background component survives: the error is
/// logged with its chain and the component carries on. Fatal startup errors
/// bubble up through `main` instead.
pub fn report_error(e: &mut anyhow::Error) {
    tracing::error!("Caught error (actually reporting it): {e:#}");
}
