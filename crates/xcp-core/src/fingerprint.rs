//! Discovery request fingerprint: the total hash over every input that can
//! influence response bytes. Used both as the discovery cache key and as
//! the `version_info` field returned to the proxy.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Every input captured by a single discovery request that can influence
/// the rendered response.
#[derive(Debug, Clone)]
pub struct FingerprintInputs {
    pub resource_type: String,
    pub proxy_version: String,
    /// Requested resource names: an *unordered* set. Reordering must not
    /// change the fingerprint.
    pub requested_names: Vec<String>,
    pub node_match_key_value: Option<String>,
    pub host_header: Option<String>,
    pub template_checksum: String,
    pub context_checksum: String,
    pub instances_generation: String,
    pub cipher_suite_identity: String,
    pub api_generation: String,
    /// Additional deployment-configured keys, already name-sorted by virtue
    /// of `BTreeMap`.
    pub extra_keys: BTreeMap<String, String>,
}

impl FingerprintInputs {
    /// Compute the deterministic fingerprint. A non-cryptographic,
    /// fixed-seed hash would suffice per design note §9; SHA-256 is used
    /// here for simplicity and is equally deterministic.
    pub fn compute(&self) -> String {
        let mut hasher = Sha256::new();

        hasher.update(b"resource_type=");
        hasher.update(self.resource_type.as_bytes());
        hasher.update(b"\x00proxy_version=");
        hasher.update(self.proxy_version.as_bytes());
        hasher.update(b"\x00api_generation=");
        hasher.update(self.api_generation.as_bytes());

        let mut sorted_names = self.requested_names.clone();
        sorted_names.sort();
        hasher.update(b"\x00requested_names=");
        hasher.update(sorted_names.join(",").as_bytes());

        hasher.update(b"\x00node_match=");
        hasher.update(self.node_match_key_value.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\x00host=");
        hasher.update(self.host_header.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\x00template_checksum=");
        hasher.update(self.template_checksum.as_bytes());
        hasher.update(b"\x00context_checksum=");
        hasher.update(self.context_checksum.as_bytes());
        hasher.update(b"\x00instances_generation=");
        hasher.update(self.instances_generation.as_bytes());
        hasher.update(b"\x00cipher_identity=");
        hasher.update(self.cipher_suite_identity.as_bytes());

        hasher.update(b"\x00extra=");
        for (k, v) in &self.extra_keys {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b";");
        }

        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> FingerprintInputs {
        FingerprintInputs {
            resource_type: "clusters".to_string(),
            proxy_version: "1.25.3".to_string(),
            requested_names: vec!["a".to_string(), "b".to_string()],
            node_match_key_value: Some("T1".to_string()),
            host_header: Some("proxy.example".to_string()),
            template_checksum: "tpl-checksum".to_string(),
            context_checksum: "ctx-checksum".to_string(),
            instances_generation: "gen-1".to_string(),
            cipher_suite_identity: "cipher-1".to_string(),
            api_generation: "v3".to_string(),
            extra_keys: BTreeMap::new(),
        }
    }

    #[test]
    fn reordering_requested_names_does_not_change_fingerprint() {
        let mut a = base();
        let mut b = base();
        b.requested_names = vec!["b".to_string(), "a".to_string()];
        a.requested_names.reverse();
        assert_eq!(a.compute(), b.compute());
    }

    #[test]
    fn changing_instances_generation_changes_fingerprint() {
        let a = base();
        let mut b = base();
        b.instances_generation = "gen-2".to_string();
        assert_ne!(a.compute(), b.compute());
    }

    #[test]
    fn identical_inputs_produce_identical_fingerprints() {
        assert_eq!(base().compute(), base().compute());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn fingerprint_is_invariant_under_requested_name_reordering(
                names in prop::collection::vec("[a-z]{1,8}", 0..6),
                shuffle_seed in 0u64..1000,
            ) {
                let mut shuffled = names.clone();
                // Deterministic pseudo-shuffle: rotate by the seed so the
                // test stays reproducible without pulling in `rand` here.
                if !shuffled.is_empty() {
                    let rotate_by = (shuffle_seed as usize) % shuffled.len();
                    shuffled.rotate_left(rotate_by);
                }

                let mut a = base();
                a.requested_names = names;
                let mut b = base();
                b.requested_names = shuffled;

                prop_assert_eq!(a.compute(), b.compute());
            }

            #[test]
            fn fingerprint_changes_when_instances_generation_differs(
                gen_a in "[a-f0-9]{8}",
                gen_b in "[a-f0-9]{8}",
            ) {
                prop_assume!(gen_a != gen_b);
                let mut a = base();
                a.instances_generation = gen_a;
                let mut b = base();
                b.instances_generation = gen_b;
                prop_assert_ne!(a.compute(), b.compute());
            }
        }
    }

    #[test]
    fn changing_any_captured_field_changes_the_fingerprint() {
        let a = base();
        let variants = [
            { let mut b = base(); b.resource_type = "listeners".to_string(); b },
            { let mut b = base(); b.proxy_version = "1.26.0".to_string(); b },
            { let mut b = base(); b.node_match_key_value = Some("T2".to_string()); b },
            { let mut b = base(); b.host_header = Some("other".to_string()); b },
            { let mut b = base(); b.template_checksum = "other".to_string(); b },
            { let mut b = base(); b.context_checksum = "other".to_string(); b },
            { let mut b = base(); b.cipher_suite_identity = "other".to_string(); b },
            { let mut b = base(); b.api_generation = "v2".to_string(); b },
        ];
        for variant in variants {
            assert_ne!(a.compute(), variant.compute());
        }
    }
}
