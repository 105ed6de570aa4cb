//! Recovering toolchain metadata from the event log.

use crate::sync::model::{
    Event, Provenance, SERVICE_INSTANCE_KIND, TOOLCHAIN_KIND, ToolchainId, UNKNOWN_ORGANIZATION,
    Verb,
};

/// Reads provenance out of a single event. `fallback` names the toolchain when
/// neither subject of the event is a toolchain.
pub fn provenance_of(event: &Event, fallback: &ToolchainId) -> Provenance {
    let toolchain_guid = [event.object.as_ref(), event.target.as_ref()]
        .into_iter()
        .flatten()
        .find(|subject| subject.is_kind(TOOLCHAIN_KIND))
        .and_then(|subject| subject.id.as_deref())
        .and_then(ToolchainId::parse)
        .unwrap_or_else(|| fallback.clone());

    let generator = match event.object.as_ref() {
        Some(object) if !object.is_kind(SERVICE_INSTANCE_KIND) => {
            object.generator.clone().or_else(|| event.generator.clone())
        }
        _ => event.generator.clone(),
    };

    let organization_guid = event
        .object
        .as_ref()
        .and_then(|object| object.organization.as_ref())
        .and_then(|org| org.id.clone())
        .unwrap_or_else(|| UNKNOWN_ORGANIZATION.to_string());

    Provenance {
        toolchain_guid,
        generator,
        organization_guid,
        creator: event.actor.as_ref().and_then(|actor| actor.id.clone()),
        created: event.published.clone(),
    }
}

/// Picks the event to take provenance from: among events emitted by the
/// trusted generator, the first `create` if any, else the latest published.
/// Ties on `published` keep the earliest event in log order.
pub fn best_event<'a>(events: &'a [Event], trusted_generator: &str) -> Option<&'a Event> {
    let trusted = || {
        events
            .iter()
            .filter(move |event| event.generator.as_deref() == Some(trusted_generator))
    };
    trusted()
        .find(|event| event.is_verb(Verb::Create))
        .or_else(|| {
            trusted().reduce(|best, event| {
                if event.published > best.published {
                    event
                } else {
                    best
                }
            })
        })
}

/// Publication time of the first `delete` event, if the log has one.
pub fn deletion_time(events: &[Event]) -> Option<String> {
    events
        .iter()
        .filter(|event| event.is_verb(Verb::Delete))
        .find_map(|event| event.published.clone())
}
