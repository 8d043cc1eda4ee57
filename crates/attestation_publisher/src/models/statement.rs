// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::oci::Digest;

/// Represents the in-toto statement structure.
#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InTotoStatement {
    #[serde(rename = "_type")]
    pub statement_type: String,
    pub subject: Vec<Subject>,
    pub predicate_type: String,
    #[serde(default)]
    pub predicate: serde_json::Value,
}

impl InTotoStatement {
    /// True if any subject is addressed by `digest`.
    pub(crate) fn covers(&self, digest: &Digest) -> bool {
        self.subject.iter().any(|subject| {
            subject
                .digest
                .get(digest.algorithm())
                .is_some_and(|value| value.eq_ignore_ascii_case(digest.hex()))
        })
    }
}

/// Simplified ResourceDescriptor for the subject of the in-toto statement.
#[derive(Deserialize, Serialize, Debug)]
pub(crate) struct Subject {
    #[serde(default)]
    pub name: Option<String>,
    pub digest: HashMap<String, String>,
}
