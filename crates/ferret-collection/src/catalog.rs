//! Catalog key layout. `$`-prefixed keys sort before record keys, grouping
//! collection metadata at the front of the keyspace:
//!
//! - `$CM_<name>`            collection meta JSON
//! - `$CS_<name>`            next sequence id, ASCII
//! - `$CO_<name>_<id>`       override JSON
//! - `$SY_<name>_<id>`       synonym JSON
//! - `<cid>_$DI_<doc_id>`    doc id → seq id, ASCII
//! - `<cid>_$SI_<be32(seq)>` seq id → document JSON

pub const META_PREFIX: &str = "$CM_";
pub const SEQ_PREFIX: &str = "$CS_";
pub const OVERRIDE_PREFIX: &str = "$CO_";
pub const SYNONYM_PREFIX: &str = "$SY_";

pub fn meta_key(name: &str) -> Vec<u8> {
    format!("{META_PREFIX}{name}").into_bytes()
}

pub fn seq_counter_key(name: &str) -> Vec<u8> {
    format!("{SEQ_PREFIX}{name}").into_bytes()
}

pub fn override_key(name: &str, override_id: &str) -> Vec<u8> {
    format!("{OVERRIDE_PREFIX}{name}_{override_id}").into_bytes()
}

pub fn override_prefix(name: &str) -> Vec<u8> {
    format!("{OVERRIDE_PREFIX}{name}_").into_bytes()
}

pub fn synonym_key(name: &str, synonym_id: &str) -> Vec<u8> {
    format!("{SYNONYM_PREFIX}{name}_{synonym_id}").into_bytes()
}

pub fn synonym_prefix(name: &str) -> Vec<u8> {
    format!("{SYNONYM_PREFIX}{name}_").into_bytes()
}

pub fn doc_id_key(collection_id: u32, doc_id: &str) -> Vec<u8> {
    format!("{collection_id}_$DI_{doc_id}").into_bytes()
}

pub fn doc_id_prefix(collection_id: u32) -> Vec<u8> {
    format!("{collection_id}_$DI_").into_bytes()
}

/// Big-endian seq encoding keeps `$SI_` scans in insertion order.
pub fn seq_id_key(collection_id: u32, seq_id: u32) -> Vec<u8> {
    let mut key = format!("{collection_id}_$SI_").into_bytes();
    key.extend_from_slice(&seq_id.to_be_bytes());
    key
}

pub fn seq_id_prefix(collection_id: u32) -> Vec<u8> {
    format!("{collection_id}_$SI_").into_bytes()
}

/// Seq id from an `$SI_` key, when the trailing bytes are a whole be32.
pub fn parse_seq_id_key(key: &[u8]) -> Option<u32> {
    if key.len() < 4 {
        return None;
    }
    let tail: [u8; 4] = key[key.len() - 4..].try_into().ok()?;
    Some(u32::from_be_bytes(tail))
}
