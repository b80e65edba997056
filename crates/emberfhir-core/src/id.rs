use uuid::Uuid;

/// Generate a fresh server-assigned resource id.
pub fn next_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(next_id(), next_id());
    }
}
