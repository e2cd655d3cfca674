//! The record data model.
//!
//! A record is a UUID-identified, versioned document describing a sequencing
//! experiment. Every mutation appends a timestamped comment to the record's
//! history, together with the CID the record held at the time, so divergent
//! copies can be reasoned about and rolled back.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto;
use crate::error::{Error, Result};

/// A single entry in a record's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub timestamp: DateTime<Utc>,
    pub text: String,
    /// The CID the record held when this comment was appended.
    #[serde(rename = "previousCID", default)]
    pub previous_cid: String,
}

impl Comment {
    pub fn new(text: impl Into<String>, previous_cid: impl Into<String>) -> Self {
        Comment {
            timestamp: Utc::now(),
            text: text.into(),
            previous_cid: previous_cid.into(),
        }
    }
}

/// A versioned, UUID-identified document describing a sequencing experiment.
///
/// Records are owned by their caller and passed by value across the database
/// API; the database serializes a copy on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identity. Holds ciphertext while `encrypted` is set.
    #[serde(default)]
    uuid: String,
    /// The last known CID of this record in the DAG, empty on creation.
    #[serde(rename = "previousCID", default)]
    previous_cid: String,
    #[serde(default)]
    history: Vec<Comment>,
    #[serde(default)]
    encrypted: bool,
    /// Human readable label, also the default lookup key.
    #[serde(default)]
    alias: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "linkedSamples", default)]
    linked_samples: BTreeMap<String, String>,
    #[serde(rename = "linkedLibraries", default)]
    linked_libraries: BTreeMap<String, String>,
    #[serde(default)]
    barcodes: BTreeMap<String, i32>,
}

impl Record {
    /// Returns a builder for a new record.
    pub fn builder() -> RecordBuilder {
        RecordBuilder::default()
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn previous_cid(&self) -> &str {
        &self.previous_cid
    }

    pub(crate) fn set_previous_cid(&mut self, cid: impl Into<String>) {
        self.previous_cid = cid.into();
    }

    pub fn history(&self) -> &[Comment] {
        &self.history
    }

    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Updates the alias and notes the change in the history.
    pub fn set_alias(&mut self, alias: impl Into<String>) {
        let alias = alias.into();
        if !alias.is_empty() {
            self.alias = alias;
            self.add_comment("alias updated.");
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Updates the description and notes the change in the history.
    pub fn set_description(&mut self, description: impl Into<String>) {
        let description = description.into();
        if !description.is_empty() {
            self.description = description;
            self.add_comment("description updated.");
        }
    }

    pub fn linked_samples(&self) -> &BTreeMap<String, String> {
        &self.linked_samples
    }

    pub fn linked_libraries(&self) -> &BTreeMap<String, String> {
        &self.linked_libraries
    }

    pub fn barcodes(&self) -> &BTreeMap<String, i32> {
        &self.barcodes
    }

    /// Appends a timestamped comment to the record's history, along with the
    /// last known CID to enable rollbacks.
    pub fn add_comment(&mut self, text: impl Into<String>) {
        self.history
            .push(Comment::new(text, self.previous_cid.clone()));
    }

    /// Links a sample to the record.
    ///
    /// Fails if the sample UUID is already linked.
    pub fn link_sample(&mut self, sample: Uuid, location: impl Into<String>) -> Result<()> {
        let sample = sample.to_string();
        if self.linked_samples.contains_key(&sample) {
            return Err(Error::LinkExists(sample));
        }
        self.linked_samples.insert(sample.clone(), location.into());
        self.add_comment(format!("linked record to sample ({})", sample));
        Ok(())
    }

    /// Links a library to the record.
    ///
    /// Fails if the library UUID is already linked.
    pub fn link_library(&mut self, library: Uuid, location: impl Into<String>) -> Result<()> {
        let library = library.to_string();
        if self.linked_libraries.contains_key(&library) {
            return Err(Error::LinkExists(library));
        }
        self.linked_libraries
            .insert(library.clone(), location.into());
        self.add_comment(format!("linked record to library ({})", library));
        Ok(())
    }

    /// Assigns a barcode to a linked entity.
    ///
    /// Fails if the UUID already carries a barcode.
    pub fn add_barcode(&mut self, entity: Uuid, barcode: i32) -> Result<()> {
        let entity = entity.to_string();
        if self.barcodes.contains_key(&entity) {
            return Err(Error::LinkExists(entity));
        }
        self.barcodes.insert(entity.clone(), barcode);
        self.add_comment(format!("added barcode to record ({})", entity));
        Ok(())
    }

    /// The timestamp of the first history entry.
    pub fn created_timestamp(&self) -> Option<DateTime<Utc>> {
        self.history.first().map(|c| c.timestamp)
    }

    /// The timestamp of the most recent history entry.
    pub fn last_updated_timestamp(&self) -> Option<DateTime<Utc>> {
        self.history.last().map(|c| c.timestamp)
    }

    /// Encrypts the record's protected fields in place.
    ///
    /// Currently only the UUID is encrypted. Fails if the record is already
    /// encrypted.
    pub fn encrypt(&mut self, key: &[u8]) -> Result<()> {
        if self.encrypted {
            return Err(Error::Encrypted);
        }
        self.uuid = crypto::encrypt(&self.uuid, key)?;
        self.encrypted = true;
        Ok(())
    }

    /// Decrypts the record's protected fields in place.
    ///
    /// Plaintext records are left untouched.
    pub fn decrypt(&mut self, key: &[u8]) -> Result<()> {
        if !self.encrypted {
            return Ok(());
        }
        self.uuid = crypto::decrypt(&self.uuid, key)?;
        self.encrypted = false;
        Ok(())
    }
}

/// Builder for [`Record`].
#[derive(Debug, Default)]
pub struct RecordBuilder {
    alias: Option<String>,
    description: Option<String>,
}

impl RecordBuilder {
    /// Sets the human readable label of the record.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Sets the description of the record.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Creates the record, assigning it a fresh UUID and starting its
    /// history.
    pub fn build(self) -> Record {
        let mut record = Record {
            uuid: Uuid::new_v4().to_string(),
            previous_cid: String::new(),
            history: Vec::new(),
            encrypted: false,
            alias: String::new(),
            description: String::new(),
            linked_samples: BTreeMap::new(),
            linked_libraries: BTreeMap::new(),
            barcodes: BTreeMap::new(),
        };
        record.add_comment("record created.");
        if let Some(alias) = self.alias {
            record.set_alias(alias);
        }
        if let Some(description) = self.description {
            record.set_description(description);
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_starts_history() {
        let record = Record::builder()
            .alias("test record")
            .description("this is a test record")
            .build();

        assert!(!record.uuid().is_empty());
        assert!(record.previous_cid().is_empty());
        assert_eq!(record.alias(), "test record");
        assert_eq!(record.description(), "this is a test record");
        // creation plus the two field updates
        assert_eq!(record.history().len(), 3);
        assert_eq!(record.history()[0].text, "record created.");
    }

    #[test]
    fn history_timestamps_non_decreasing() {
        let mut record = Record::builder().alias("ordered").build();
        for i in 0..10 {
            record.add_comment(format!("comment {}", i));
        }
        let stamps: Vec<_> = record.history().iter().map(|c| c.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(record.created_timestamp(), Some(stamps[0]));
        assert_eq!(
            record.last_updated_timestamp(),
            Some(stamps[stamps.len() - 1])
        );
    }

    #[test]
    fn duplicate_links_rejected() {
        let mut record = Record::builder().alias("linked").build();
        let sample = Uuid::new_v4();
        record.link_sample(sample, "/seq/run1").unwrap();
        assert!(matches!(
            record.link_sample(sample, "/seq/run2"),
            Err(Error::LinkExists(_))
        ));

        let library = Uuid::new_v4();
        record.link_library(library, "/libs/a").unwrap();
        assert!(matches!(
            record.link_library(library, "/libs/b"),
            Err(Error::LinkExists(_))
        ));

        let entity = Uuid::new_v4();
        record.add_barcode(entity, 7).unwrap();
        assert!(matches!(
            record.add_barcode(entity, 8),
            Err(Error::LinkExists(_))
        ));
    }

    #[test]
    fn encrypt_round_trip() {
        let key = crate::crypto::password_to_cipher_key("dummy password").unwrap();
        let mut record = Record::builder().alias("secret").build();
        let plain_uuid = record.uuid().to_string();

        record.encrypt(&key).unwrap();
        assert!(record.encrypted());
        assert_ne!(record.uuid(), plain_uuid);

        // double encryption is refused
        assert!(matches!(record.encrypt(&key), Err(Error::Encrypted)));

        record.decrypt(&key).unwrap();
        assert!(!record.encrypted());
        assert_eq!(record.uuid(), plain_uuid);

        // decrypting a plaintext record is a no-op
        record.decrypt(&key).unwrap();
        assert_eq!(record.uuid(), plain_uuid);
    }

    #[test]
    fn wire_format_round_trip() {
        let mut record = Record::builder().alias("wire").build();
        record.link_sample(Uuid::new_v4(), "/somewhere").unwrap();

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"previousCID\""));
        assert!(json.contains("\"linkedSamples\""));

        let decoded: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }
}
