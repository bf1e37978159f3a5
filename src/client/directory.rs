//! The client's cached view of who is reachable and where, built from
//! `client_list` replies. Isolated from the WebSocket plumbing in
//! `engine.rs` so the `symm_keys` grouping/ordering fix in the
//! protocol's design notes has its own focused unit tests.

use std::collections::{BTreeMap, HashMap};

use rsa::RsaPublicKey;

use crate::crypto::{self, Fingerprint};
use crate::envelope::ServerListing;
use crate::error::ClientError;

#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub public_key: RsaPublicKey,
    pub home_server: String,
}

/// Fingerprint → (public key, home server), rebuilt wholesale on every
/// `client_list` reply. The directory is an unauthenticated hint — see
/// the protocol's design note on a malicious peer being able to lie
/// about who it hosts — so nothing here is treated as proof of
/// anything beyond "try this address".
#[derive(Debug, Default)]
pub struct Directory {
    entries: HashMap<Fingerprint, DirectoryEntry>,
}

impl Directory {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn get(&self, fingerprint: &str) -> Option<&DirectoryEntry> {
        self.entries.get(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.entries.keys().cloned().collect()
    }

    /// Replace the whole directory from a `client_list` reply. Each
    /// server's `clients` field is PEM public keys, not bare
    /// fingerprints (see `ServerListing`'s doc comment) — the
    /// fingerprint of each entry is derived here, locally, from the
    /// key itself. A key that fails to parse is skipped rather than
    /// failing the whole refresh; one malformed gossiped entry from a
    /// misbehaving peer shouldn't blind the client to every other
    /// server's listing.
    pub fn replace_from_client_list(&mut self, servers: &[ServerListing]) {
        let mut entries = HashMap::new();
        for server in servers {
            for pem in &server.clients {
                let Ok(public_key) = crypto::public_key_from_pem(pem) else {
                    continue;
                };
                let fingerprint = crypto::fingerprint_of_pem(pem);
                entries.insert(
                    fingerprint,
                    DirectoryEntry {
                        public_key,
                        home_server: server.address.clone(),
                    },
                );
            }
        }
        self.entries = entries;
    }
}

/// Group recipient fingerprints by their cached home-server address.
///
/// Returns `(destination_servers, symm_key_order)` where
/// `destination_servers` is the sorted-unique list of addresses the
/// spec's `chat` payload carries, and `symm_key_order` is the flat,
/// per-address-grouped list of recipient fingerprints in the exact
/// order their `symm_keys` slots must be built in: grouped by
/// `destination_servers` order, and within a group, ordered by the
/// position each recipient held in the caller's original `recipients`
/// slice (the "order the sender used to add recipients" the spec's
/// design notes call for).
pub fn group_recipients_by_server(
    directory: &Directory,
    recipients: &[Fingerprint],
) -> Result<(Vec<String>, Vec<Fingerprint>), ClientError> {
    let mut groups: BTreeMap<String, Vec<Fingerprint>> = BTreeMap::new();
    for fp in recipients {
        let entry = directory
            .get(fp)
            .ok_or_else(|| ClientError::UnknownRecipient(fp.clone()))?;
        groups.entry(entry.home_server.clone()).or_default().push(fp.clone());
    }

    let destination_servers: Vec<String> = groups.keys().cloned().collect();
    let symm_key_order: Vec<Fingerprint> = groups.into_values().flatten().collect();
    Ok((destination_servers, symm_key_order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn entry(directory: &mut Directory, home_server: &str) -> Fingerprint {
        let keys = KeyPair::generate().unwrap();
        let pem = keys.public_pem().unwrap();
        let fp = crypto::fingerprint_of_pem(&pem);
        directory.entries.insert(
            fp.clone(),
            DirectoryEntry {
                public_key: keys.public,
                home_server: home_server.to_string(),
            },
        );
        fp
    }

    #[test]
    fn groups_recipients_by_home_server_with_sorted_unique_addresses() {
        let mut dir = Directory::new();
        let a1 = entry(&mut dir, "10.0.0.2:9001");
        let a2 = entry(&mut dir, "10.0.0.1:9001");
        let a3 = entry(&mut dir, "10.0.0.2:9001");

        let (servers, order) = group_recipients_by_server(&dir, &[a1.clone(), a2.clone(), a3.clone()]).unwrap();

        assert_eq!(servers, vec!["10.0.0.1:9001".to_string(), "10.0.0.2:9001".to_string()]);
        // Group for 10.0.0.1 (a2) comes first, then 10.0.0.2's group
        // preserving a1-before-a3, the order they were passed in.
        assert_eq!(order, vec![a2, a1, a3]);
    }

    #[test]
    fn unknown_recipient_is_rejected() {
        let dir = Directory::new();
        let err = group_recipients_by_server(&dir, &["nobody".to_string()]).unwrap_err();
        assert!(matches!(err, ClientError::UnknownRecipient(_)));
    }

    #[test]
    fn replace_from_client_list_skips_malformed_keys() {
        let mut dir = Directory::new();
        let servers = vec![ServerListing {
            address: "127.0.0.1:9001".to_string(),
            server_fingerprint: "srv-fp".to_string(),
            clients: vec!["not a pem".to_string()],
        }];
        dir.replace_from_client_list(&servers);
        assert!(dir.is_empty());
    }

    #[test]
    fn replace_from_client_list_derives_fingerprint_from_pem() {
        let mut dir = Directory::new();
        let keys = KeyPair::generate().unwrap();
        let pem = keys.public_pem().unwrap();
        let expected_fp = crypto::fingerprint_of_pem(&pem);

        let servers = vec![ServerListing {
            address: "127.0.0.1:9001".to_string(),
            server_fingerprint: "srv-fp".to_string(),
            clients: vec![pem],
        }];
        dir.replace_from_client_list(&servers);

        assert_eq!(dir.len(), 1);
        assert!(dir.get(&expected_fp).is_some());
    }
}
