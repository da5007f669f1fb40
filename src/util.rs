use std::any::Any;

/// Turn a caught panic payload into an error, preserving string payloads.
pub(crate) fn try_to_extract_panic_info(info: &dyn Any) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<String>() {
        anyhow::anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<&str>() {
        anyhow::anyhow!("job panicked: {message}")
    } else {
        anyhow::anyhow!("job panicked")
    }
}
