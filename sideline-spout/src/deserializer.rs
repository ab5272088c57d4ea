// Copyright (C) 2024 Sideline, Inc.
//
// Sideline is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@sideline.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::fmt;

use tracing::debug;

/// Turns raw record bytes into a record value. Pure, no I/O. Returning `None`
/// marks the record invalid: it is dropped and its offset self-acked.
pub trait Deserializer: Send + Sync + fmt::Debug {
    fn deserialize(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> Option<serde_json::Value>;
}

/// Decodes the payload as a JSON document. Empty or corrupted payloads are
/// skipped.
#[derive(Debug, Default)]
pub struct JsonDeserializer;

impl Deserializer for JsonDeserializer {
    fn deserialize(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        _key: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> Option<serde_json::Value> {
        let payload = match payload {
            Some(payload) if !payload.is_empty() => payload,
            _ => {
                debug!(topic = %topic, partition = %partition, offset = %offset, "Record payload is empty.");
                return None;
            }
        };
        match serde_json::from_slice(payload) {
            Ok(value) => Some(value),
            Err(error) => {
                debug!(
                    topic = %topic,
                    partition = %partition,
                    offset = %offset,
                    error = %error,
                    "Failed to deserialize record payload."
                );
                None
            }
        }
    }
}
