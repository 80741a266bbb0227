mod message;
mod todo;
mod tool;

pub use message::*;
pub use todo::*;
pub use tool::*;

/// Generates a short, prefixed identifier such as `run-3f9c1a2b7d4e`.
pub fn prefixed_id(prefix: &str) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &raw[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_ids_are_unique_and_prefixed() {
        let a = prefixed_id("run");
        let b = prefixed_id("run");
        assert!(a.starts_with("run-"));
        assert_eq!(a.len(), "run-".len() + 12);
        assert_ne!(a, b);
    }
}
