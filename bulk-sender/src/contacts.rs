//! Contact registry - the ordered, shared list of broadcast recipients.
//!
//! Insertion order is the send order. A contact's identity is its address
//! after normalization, so `03001234567` and `+923001234567` are the same
//! recipient and can never both be present.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::util::normalize_address;

/// Delivery status of a single contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    #[default]
    Pending,
    Sending,
    Sent,
    Failed,
}

/// A broadcast recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Raw phone number as uploaded
    pub address: String,
    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub status: ContactStatus,
}

/// A contact as supplied by an upload or manual add.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInput {
    pub address: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl ContactInput {
    pub fn new(address: impl Into<String>, display_name: Option<&str>) -> Self {
        Self {
            address: address.into(),
            display_name: display_name.map(str::to_string),
        }
    }

    fn into_contact(self) -> Contact {
        Contact {
            address: self.address.trim().to_string(),
            display_name: self
                .display_name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            status: ContactStatus::Pending,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("contact already exists: {0}")]
    Duplicate(String),

    #[error("no contact at index {0}")]
    NotFound(usize),

    #[error("contact address is empty")]
    EmptyAddress,
}

/// Shared, ordered contact list.
///
/// Cloning is cheap; all clones see the same list.
#[derive(Clone)]
pub struct ContactRegistry {
    inner: Arc<RwLock<Vec<Contact>>>,
    country_code: Arc<str>,
}

impl ContactRegistry {
    /// Create an empty registry. `country_code` drives identity comparison.
    pub fn new(country_code: &str) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Vec::new())),
            country_code: Arc::from(country_code),
        }
    }

    /// Identity key for an address.
    pub fn identity(&self, address: &str) -> String {
        normalize_address(address, &self.country_code)
    }

    /// Merge an uploaded list, or clear everything when `list` is empty.
    ///
    /// Entries whose identity is already present (in the registry or earlier
    /// in `list`) and entries with a blank address are dropped. Accepted
    /// entries are appended in incoming order with `pending` status.
    /// Returns the number of accepted entries.
    pub async fn replace_all(&self, list: Vec<ContactInput>) -> usize {
        let mut contacts = self.inner.write().await;

        if list.is_empty() {
            let removed = contacts.len();
            contacts.clear();
            info!(removed = removed, "contacts_cleared");
            return 0;
        }

        let incoming = list.len();
        let mut keys: HashSet<String> =
            contacts.iter().map(|c| self.identity(&c.address)).collect();
        let mut accepted = 0;

        for input in list {
            let contact = input.into_contact();
            if contact.address.is_empty() {
                continue;
            }
            if !keys.insert(self.identity(&contact.address)) {
                debug!(address = %contact.address, "contact_duplicate_dropped");
                continue;
            }
            contacts.push(contact);
            accepted += 1;
        }

        info!(
            incoming = incoming,
            accepted = accepted,
            dropped = incoming - accepted,
            total = contacts.len(),
            "contacts_merged"
        );

        accepted
    }

    /// Add one contact. A contact whose identity is already present is rejected.
    pub async fn append(&self, input: ContactInput) -> Result<Contact, RegistryError> {
        let contact = input.into_contact();
        if contact.address.is_empty() {
            return Err(RegistryError::EmptyAddress);
        }

        let mut contacts = self.inner.write().await;
        let key = self.identity(&contact.address);
        if contacts.iter().any(|c| self.identity(&c.address) == key) {
            return Err(RegistryError::Duplicate(contact.address));
        }

        contacts.push(contact.clone());
        info!(address = %contact.address, total = contacts.len(), "contact_added");
        Ok(contact)
    }

    /// Replace the address and name of the contact at `index`.
    ///
    /// The edited contact goes back to `pending`.
    pub async fn edit_at(
        &self,
        index: usize,
        input: ContactInput,
    ) -> Result<Contact, RegistryError> {
        let contact = input.into_contact();
        if contact.address.is_empty() {
            return Err(RegistryError::EmptyAddress);
        }

        let mut contacts = self.inner.write().await;
        if index >= contacts.len() {
            return Err(RegistryError::NotFound(index));
        }

        let key = self.identity(&contact.address);
        let clash = contacts
            .iter()
            .enumerate()
            .any(|(i, c)| i != index && self.identity(&c.address) == key);
        if clash {
            return Err(RegistryError::Duplicate(contact.address));
        }

        contacts[index] = contact.clone();
        info!(index = index, address = %contact.address, "contact_edited");
        Ok(contact)
    }

    /// Remove and return the contact at `index`.
    pub async fn remove_at(&self, index: usize) -> Result<Contact, RegistryError> {
        let mut contacts = self.inner.write().await;
        if index >= contacts.len() {
            return Err(RegistryError::NotFound(index));
        }
        let removed = contacts.remove(index);
        info!(index = index, address = %removed.address, total = contacts.len(), "contact_removed");
        Ok(removed)
    }

    /// Remove every contact.
    pub async fn clear(&self) {
        let mut contacts = self.inner.write().await;
        let removed = contacts.len();
        contacts.clear();
        info!(removed = removed, "contacts_cleared");
    }

    /// Copy of the current list, in send order.
    pub async fn snapshot(&self) -> Vec<Contact> {
        self.inner.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Look up a contact by identity key (see [`ContactRegistry::identity`]).
    pub async fn find(&self, key: &str) -> Option<Contact> {
        self.inner
            .read()
            .await
            .iter()
            .find(|c| self.identity(&c.address) == key)
            .cloned()
    }

    /// Set the delivery status of the contact with the same identity as
    /// `address`. Returns false when no such contact exists anymore.
    pub async fn set_status(&self, address: &str, status: ContactStatus) -> bool {
        let key = self.identity(address);
        let mut contacts = self.inner.write().await;
        match contacts.iter_mut().find(|c| self.identity(&c.address) == key) {
            Some(contact) => {
                contact.status = status;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(address: &str) -> ContactInput {
        ContactInput::new(address, None)
    }

    fn addresses(contacts: &[Contact]) -> Vec<&str> {
        contacts.iter().map(|c| c.address.as_str()).collect()
    }

    #[tokio::test]
    async fn test_replace_all_empty_clears() {
        let registry = ContactRegistry::new("92");
        registry
            .replace_all(vec![input("03001111111"), input("03002222222")])
            .await;
        registry.set_status("03001111111", ContactStatus::Sent).await;

        assert_eq!(registry.replace_all(vec![]).await, 0);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_replace_all_drops_duplicates() {
        let registry = ContactRegistry::new("92");
        registry.replace_all(vec![input("03001111111")]).await;

        let accepted = registry
            .replace_all(vec![
                input("923001111111"),  // same identity as existing
                input("03002222222"),
                input("+923002222222"), // duplicate within the upload
                input("03003333333"),
            ])
            .await;

        assert_eq!(accepted, 2);
        let snapshot = registry.snapshot().await;
        assert_eq!(
            addresses(&snapshot),
            vec!["03001111111", "03002222222", "03003333333"]
        );
    }

    #[tokio::test]
    async fn test_replace_all_large_upload_with_repeats() {
        let registry = ContactRegistry::new("92");
        let numbers: Vec<String> = (0..5_000).map(|i| format!("0300{:07}", i)).collect();
        let upload: Vec<ContactInput> = numbers
            .iter()
            .chain(numbers.iter())
            .map(|n| input(n))
            .collect();

        assert_eq!(registry.replace_all(upload).await, 5_000);
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 5_000);
        assert_eq!(snapshot[0].address, "03000000000");
        assert_eq!(snapshot[4_999].address, "03000004999");
    }

    #[tokio::test]
    async fn test_replace_all_keeps_existing_status() {
        let registry = ContactRegistry::new("92");
        registry.replace_all(vec![input("03001111111")]).await;
        registry.set_status("03001111111", ContactStatus::Failed).await;
        registry.replace_all(vec![input("03002222222")]).await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot[0].status, ContactStatus::Failed);
        assert_eq!(snapshot[1].status, ContactStatus::Pending);
    }

    #[tokio::test]
    async fn test_replace_all_skips_blank_addresses() {
        let registry = ContactRegistry::new("92");
        let accepted = registry
            .replace_all(vec![input("  "), input("03001111111")])
            .await;
        assert_eq!(accepted, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_append_rejects_duplicate() {
        let registry = ContactRegistry::new("92");
        registry
            .append(ContactInput::new(" 03001111111 ", Some(" Ali ")))
            .await
            .unwrap();

        let err = registry.append(input("+923001111111")).await.unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("+923001111111".to_string()));

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].address, "03001111111");
        assert_eq!(snapshot[0].display_name.as_deref(), Some("Ali"));
    }

    #[tokio::test]
    async fn test_append_rejects_empty() {
        let registry = ContactRegistry::new("92");
        assert_eq!(
            registry.append(input("")).await.unwrap_err(),
            RegistryError::EmptyAddress
        );
    }

    #[tokio::test]
    async fn test_remove_at() {
        let registry = ContactRegistry::new("92");
        registry
            .replace_all(vec![input("03001111111"), input("03002222222")])
            .await;

        let removed = registry.remove_at(0).await.unwrap();
        assert_eq!(removed.address, "03001111111");
        assert_eq!(registry.remove_at(5).await.unwrap_err(), RegistryError::NotFound(5));
        assert_eq!(addresses(&registry.snapshot().await), vec!["03002222222"]);
    }

    #[tokio::test]
    async fn test_edit_at_keeps_uniqueness() {
        let registry = ContactRegistry::new("92");
        registry
            .replace_all(vec![input("03001111111"), input("03002222222")])
            .await;
        registry.set_status("03002222222", ContactStatus::Sent).await;

        let err = registry.edit_at(1, input("923001111111")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(_)));

        // Re-saving the same identity under a new spelling is fine
        let edited = registry
            .edit_at(1, ContactInput::new("+923002222222", Some("Sara")))
            .await
            .unwrap();
        assert_eq!(edited.status, ContactStatus::Pending);
        assert_eq!(registry.snapshot().await[1].display_name.as_deref(), Some("Sara"));
    }

    #[tokio::test]
    async fn test_set_status_and_find_by_identity() {
        let registry = ContactRegistry::new("92");
        registry.replace_all(vec![input("+923001111111")]).await;

        assert!(registry.set_status("03001111111", ContactStatus::Sending).await);
        assert!(!registry.set_status("03009999999", ContactStatus::Sent).await);

        let found = registry.find("923001111111").await.unwrap();
        assert_eq!(found.status, ContactStatus::Sending);
        assert!(registry.find("923009999999").await.is_none());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let registry = ContactRegistry::new("92");
        let other = registry.clone();
        registry.append(input("03001111111")).await.unwrap();
        assert_eq!(other.len().await, 1);
        other.clear().await;
        assert!(registry.is_empty().await);
    }

    #[test]
    fn test_contact_serialization() {
        let contact = Contact {
            address: "03001111111".to_string(),
            display_name: Some("Ali".to_string()),
            status: ContactStatus::Sent,
        };
        let json = serde_json::to_string(&contact).unwrap();
        assert_eq!(
            json,
            r#"{"address":"03001111111","displayName":"Ali","status":"sent"}"#
        );

        let parsed: ContactInput = serde_json::from_str(r#"{"address":"0300"}"#).unwrap();
        assert_eq!(parsed.display_name, None);
    }
}
