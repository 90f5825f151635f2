//! Mode negotiation: maps stream requests onto catalog subdevice modes.

use std::collections::BTreeMap;

use tracing::debug;

use crate::catalog::{
    CameraInfo, ConstrainedProperty, ConstraintAction, InterstreamConstraint, SubdeviceMode,
};
use crate::error::ConfigurationError;
use crate::traits::{Stream, StreamRequest};

/// Stream requests keyed by logical stream.
pub type RequestMap = BTreeMap<Stream, StreamRequest>;

/// Outcome of a successful negotiation.
#[derive(Debug, Clone)]
pub struct Negotiation<'a> {
    /// Requests after the interstream constraints ran.
    pub requests: RequestMap,
    /// Selected mode per subdevice that has enabled requests, by index.
    pub modes: Vec<&'a SubdeviceMode>,
}

fn enabled(requests: &RequestMap, stream: Stream) -> Option<StreamRequest> {
    requests.get(&stream).copied().filter(|request| request.enabled)
}

fn agrees(a: &StreamRequest, b: &StreamRequest, property: ConstrainedProperty) -> bool {
    match property {
        ConstrainedProperty::Fps => a.fps == b.fps,
        ConstrainedProperty::Resolution => (a.width, a.height) == (b.width, b.height),
        ConstrainedProperty::Format => a.format == b.format,
    }
}

/// Apply the catalog's interstream constraints, in order, to `requests`.
///
/// Constraints only bind when both of their streams are enabled.
pub fn enforce_interstream_constraints(
    requests: &mut RequestMap,
    constraints: &[InterstreamConstraint],
) -> Result<(), ConfigurationError> {
    for constraint in constraints {
        let (Some(a), Some(mut b)) = (
            enabled(requests, constraint.a),
            enabled(requests, constraint.b),
        ) else {
            continue;
        };
        if agrees(&a, &b, constraint.property) {
            continue;
        }

        match constraint.action {
            ConstraintAction::Reject => {
                return Err(ConfigurationError::ConstraintViolated {
                    a: constraint.a,
                    b: constraint.b,
                    property: constraint.property.name(),
                });
            }
            ConstraintAction::Propagate => {
                match constraint.property {
                    ConstrainedProperty::Fps => b.fps = a.fps,
                    ConstrainedProperty::Resolution => {
                        b.width = a.width;
                        b.height = a.height;
                    }
                    ConstrainedProperty::Format => b.format = a.format,
                }
                debug!(
                    from = %constraint.a,
                    to = %constraint.b,
                    property = constraint.property.name(),
                    "Propagated interstream constraint"
                );
                requests.insert(constraint.b, b);
            }
        }
    }

    Ok(())
}

fn describe(requested: &[(Stream, StreamRequest)]) -> String {
    requested
        .iter()
        .map(|(stream, request)| {
            format!(
                "{stream} {}x{} {} @ {}fps",
                request.width, request.height, request.format, request.fps
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Select the first catalog mode of `subdevice` that satisfies every enabled
/// request routed to it.
///
/// Returns `Ok(None)` when no enabled request is routed to the subdevice.
pub fn select_mode<'a>(
    requests: &RequestMap,
    info: &'a CameraInfo,
    subdevice: usize,
) -> Result<Option<&'a SubdeviceMode>, ConfigurationError> {
    let requested: Vec<(Stream, StreamRequest)> = requests
        .iter()
        .filter(|(stream, request)| {
            request.enabled && info.subdevice_for(**stream) == Some(subdevice)
        })
        .map(|(stream, request)| (*stream, *request))
        .collect();

    if requested.is_empty() {
        return Ok(None);
    }

    info.modes_for(subdevice)
        .find(|mode| {
            requested.iter().all(|(stream, request)| {
                mode.streams
                    .iter()
                    .any(|stream_mode| stream_mode.stream == *stream && request.is_satisfied_by(stream_mode))
            })
        })
        .map(Some)
        .ok_or_else(|| ConfigurationError::NoMatchingMode {
            subdevice,
            requested: describe(&requested),
        })
}

/// Run the constraint pass once, then select a mode for every subdevice.
///
/// Fails on the first subdevice that has enabled requests but no satisfying
/// mode; nothing is selected in that case.
pub fn negotiate<'a>(
    requests: &RequestMap,
    info: &'a CameraInfo,
) -> Result<Negotiation<'a>, ConfigurationError> {
    let mut requests = requests.clone();
    enforce_interstream_constraints(&mut requests, &info.constraints)?;

    let mut modes = Vec::new();
    for subdevice in 0..info.subdevice_count() {
        if let Some(mode) = select_mode(&requests, info, subdevice)? {
            debug!(
                subdevice,
                width = mode.width,
                height = mode.height,
                fourcc = %mode.fourcc,
                fps = mode.fps,
                "Selected subdevice mode"
            );
            modes.push(mode);
        }
    }

    Ok(Negotiation { requests, modes })
}
