//! Who may observe an object.

use crate::types::TaggedObject;

/// Decide whether `viewer` may observe `object`.
///
/// Unrestricted objects are public, anonymous viewers included. A recipient
/// list limits the object to its owner and the listed identities.
pub fn is_visible(object: &TaggedObject, viewer: Option<&str>) -> bool {
    match &object.recipients {
        None => true,
        Some(recipients) => match viewer {
            None => false,
            Some(viewer) => viewer == object.owner || recipients.iter().any(|r| r == viewer),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObjectInput, Version};
    use proptest::prelude::*;

    fn restricted(owner: &str, recipients: &[&str]) -> TaggedObject {
        ObjectInput::new("k")
            .tag("t")
            .recipients(recipients.iter().copied())
            .into_object(owner, Version(1))
    }

    #[test]
    fn test_public_object_visible_to_everyone() {
        let object = ObjectInput::new("k").tag("t").into_object("u", Version(1));
        assert!(is_visible(&object, None));
        assert!(is_visible(&object, Some("u")));
        assert!(is_visible(&object, Some("someone-else")));
    }

    #[test]
    fn test_restricted_object() {
        let object = restricted("u", &["r"]);
        assert!(is_visible(&object, Some("u")));
        assert!(is_visible(&object, Some("r")));
        assert!(!is_visible(&object, Some("s")));
        assert!(!is_visible(&object, None));
    }

    #[test]
    fn test_empty_recipient_list_is_owner_only() {
        let object = restricted("u", &[]);
        assert!(is_visible(&object, Some("u")));
        assert!(!is_visible(&object, Some("r")));
    }

    proptest! {
        #[test]
        fn prop_owner_always_sees_own_objects(
            owner in "[a-z]{1,8}",
            recipients in proptest::collection::vec("[a-z]{1,8}", 0..5),
        ) {
            let refs: Vec<&str> = recipients.iter().map(String::as_str).collect();
            let object = restricted(&owner, &refs);
            prop_assert!(is_visible(&object, Some(&owner)));
        }

        #[test]
        fn prop_outsiders_never_see_restricted(
            owner in "[a-z]{1,8}",
            recipients in proptest::collection::vec("[a-z]{1,8}", 0..5),
            viewer in "[A-Z]{1,8}",
        ) {
            let refs: Vec<&str> = recipients.iter().map(String::as_str).collect();
            let object = restricted(&owner, &refs);
            prop_assert!(!is_visible(&object, Some(&viewer)));
            prop_assert!(!is_visible(&object, None));
        }
    }
}
