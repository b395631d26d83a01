use crate::api::RecordEvent;

/// Key format: "{path}:{event}", e.g. "/messages:created"
pub fn event_key(path: &str, event: RecordEvent) -> String {
    format!("{}:{}", path, event.as_str())
}

/// Split an event key back into its path and event.
/// Splits on the last `:` so paths containing colons survive.
pub fn split_event_key(key: &str) -> Option<(&str, RecordEvent)> {
    let (path, event) = key.rsplit_once(':')?;
    Some((path, RecordEvent::parse(event)?))
}
