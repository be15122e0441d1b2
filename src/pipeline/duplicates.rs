//! Near-duplicate detection by Hamming distance between perceptual hashes.
//!
//! Every hashed item is compared against the new one, so linking is linear
//! in the number of hashed items.

use crate::catalog::{is_valid_digest, Catalog, CatalogError, DuplicateLink, ItemId};

/// Decodes a 64-char hex digest into its 32 bytes.
pub fn decode_digest(digest: &str) -> Option<Vec<u8>> {
    if !is_valid_digest(digest) {
        return None;
    }
    hex::decode(digest).ok()
}

/// Number of differing bits. `None` when lengths differ.
pub fn hamming_distance(a: &[u8], b: &[u8]) -> Option<u32> {
    if a.len() != b.len() {
        return None;
    }
    Some(a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkReport {
    pub compared: usize,
    pub created: Vec<DuplicateLink>,
}

pub struct DuplicateLinker {
    threshold: u32,
}

impl DuplicateLinker {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    /// Links `id` to every other item whose digest is within the threshold.
    ///
    /// Returns `None` when the item has no usable hash.
    pub fn link(
        &self,
        catalog: &dyn Catalog,
        id: ItemId,
    ) -> Result<Option<LinkReport>, CatalogError> {
        let Some(record) = catalog.hash(id)? else {
            return Ok(None);
        };
        let Some(digest) = decode_digest(&record.digest) else {
            log::warn!("item {id} has an invalid hash, skipping duplicate linking");
            return Ok(None);
        };

        let mut report = LinkReport::default();

        for other in catalog.hashes()? {
            if other.item_id == id {
                continue;
            }

            let Some(other_digest) = decode_digest(&other.digest) else {
                log::debug!("skipping invalid hash of item {}", other.item_id);
                continue;
            };
            let Some(distance) = hamming_distance(&digest, &other_digest) else {
                continue;
            };
            report.compared += 1;

            if distance > self.threshold {
                continue;
            }

            let link = DuplicateLink::new(id, other.item_id, distance);
            if catalog.insert_link(link)? {
                log::debug!(
                    "linked {} and {} at distance {distance}",
                    link.item_a,
                    link.item_b
                );
                report.created.push(link);
            }
        }

        Ok(Some(report))
    }
}
