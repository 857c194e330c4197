//!
//! playlist.rs
//! The in-memory playlist store: a song-name -> URL
//! map mutated only by the commit-application step of the 3PC/termination
//! protocols, never on vote or pre-commit. `NONE` is the wire spelling for
//! "no such key"; `lookup` returns an `Option` and callers render it.
use std::collections::HashMap;
use std::sync::Mutex;

pub const NONE: &str = "NONE";

#[derive(Default)]
pub struct Playlist {
    songs: Mutex<HashMap<String, String>>,
}

impl Playlist {
    pub fn new() -> Playlist {
        Playlist { songs: Mutex::new(HashMap::new()) }
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        self.songs.lock().unwrap().get(key).cloned()
    }

    pub fn upsert(&self, key: &str, value: &str) {
        self.songs.lock().unwrap().insert(key.to_string(), value.to_string());
    }

    pub fn delete(&self, key: &str) {
        self.songs.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_missing_key_is_none() {
        let p = Playlist::new();
        assert_eq!(p.lookup("SongA"), None);
    }

    #[test]
    fn upsert_then_lookup_round_trips() {
        let p = Playlist::new();
        p.upsert("SongA", "http://a");
        assert_eq!(p.lookup("SongA"), Some("http://a".to_string()));
        p.upsert("SongA", "http://b");
        assert_eq!(p.lookup("SongA"), Some("http://b".to_string()));
    }

    #[test]
    fn delete_removes_key() {
        let p = Playlist::new();
        p.upsert("SongA", "http://a");
        p.delete("SongA");
        assert_eq!(p.lookup("SongA"), None);
    }
}
