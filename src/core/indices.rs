use hashbrown::HashMap;

use crate::types::OperationId;

/// Secondary index from a key to operation ids in insertion order.
pub type VecIndex<K> = HashMap<K, Vec<OperationId>>;

/// Appends `id` under `key` unless already present.
pub fn push_unique(index: &mut VecIndex<String>, key: &str, id: &str) {
    let ids = index.entry(key.to_string()).or_default();
    if !ids.iter().any(|x| x == id) {
        ids.push(id.to_string());
    }
}

/// Removes `id` under `key`, dropping the key once empty.
pub fn remove_from(index: &mut VecIndex<String>, key: &str, id: &str) {
    if let Some(ids) = index.get_mut(key) {
        if let Some(pos) = ids.iter().position(|x| x == id) {
            ids.remove(pos);
        }
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

/// Renames `from` to `to` under `key`.
pub fn replace_in(index: &mut VecIndex<String>, key: &str, from: &str, to: &str) {
    if let Some(ids) = index.get_mut(key) {
        for x in ids.iter_mut().filter(|x| x.as_str() == from) {
            *x = to.to_string();
        }
    }
}
