//! Record constructors. The fingerprint is always computed here, never
//! supplied by the caller.

use chrono::{DateTime, Utc};
use psm_fingerprint::{digest, EncodingError};
use psm_schemas::{Identity, Payload, PropertyRecord};

/// A source-collection record.
pub fn new_source_record(
    identity: Identity,
    payload: Payload,
    at: DateTime<Utc>,
) -> Result<PropertyRecord, EncodingError> {
    let fingerprint = digest(&payload)?;
    Ok(PropertyRecord {
        identity,
        payload,
        fingerprint,
        source_fingerprint: None,
        manual_change_flag: false,
        warning_message: None,
        created_at: at,
        updated_at: at,
    })
}

/// A target record created from a source payload; baseline equals content.
pub fn new_target_record(
    identity: Identity,
    payload: Payload,
    at: DateTime<Utc>,
) -> Result<PropertyRecord, EncodingError> {
    let mut rec = new_source_record(identity, payload, at)?;
    rec.source_fingerprint = Some(rec.fingerprint.clone());
    Ok(rec)
}
