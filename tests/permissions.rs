//! Permission checker laws

use extension_runtime::extensions::manifest::CollectionDeclaration;
use extension_runtime::extensions::PermissionChecker;
use proptest::prelude::*;

fn checker(perms: &[String]) -> PermissionChecker {
    PermissionChecker::new(perms, &[])
}

fn segment() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_.-]{0,12}"
}

proptest! {
    #[test]
    fn wildcard_grants_everything_under_its_prefix(prefix in segment(), rest in segment()) {
        let checker = checker(&[format!("{}:*", prefix)]);
        let requested = format!("{}:{}", prefix, rest);
        prop_assert!(checker.has_permission(&requested));
    }

    #[test]
    fn wildcard_does_not_leak_to_other_prefixes(
        prefix in segment(),
        other in segment(),
        rest in segment(),
    ) {
        prop_assume!(!other.starts_with(&prefix) && !prefix.starts_with(&other));
        let checker = checker(&[format!("{}:*", prefix)]);
        let requested = format!("{}:{}", other, rest);
        prop_assert!(!checker.has_permission(&requested));
    }

    #[test]
    fn has_permission_matches_exact_or_wildcard_law(
        grants in proptest::collection::vec(
            prop_oneof![
                segment(),
                segment().prop_map(|s| format!("{}:*", s)),
                (segment(), segment()).prop_map(|(a, b)| format!("{}:{}", a, b)),
            ],
            0..6,
        ),
        requested in prop_oneof![
            segment(),
            (segment(), segment()).prop_map(|(a, b)| format!("{}:{}", a, b)),
        ],
    ) {
        let expected = grants.iter().any(|g| {
            g == &requested
                || g.strip_suffix('*')
                    .filter(|prefix| prefix.ends_with(':'))
                    .map(|prefix| requested.starts_with(prefix))
                    .unwrap_or(false)
        });
        prop_assert_eq!(checker(&grants).has_permission(&requested), expected);
    }

    #[test]
    fn network_host_grant_covers_every_port(host in "[a-z]{1,10}\\.example\\.com", port in 1u16..65535) {
        let checker = checker(&[format!("network:{}", host)]);
        let url = format!("http://{}:{}/path", host, port);
        prop_assert!(checker.check_network(&url).is_ok());
    }
}

#[test]
fn test_empty_grant_set_denies_every_capability() {
    let checker = checker(&[]);
    let decisions = [
        checker.check_storage(),
        checker.check_database(),
        checker.check_settings(),
        checker.check_user_profile(),
        checker.check_provider_registration(),
        checker.check_tool_registration(),
        checker.check_action_registration(),
        checker.check_scheduler(),
        checker.check_secrets(),
        checker.check_chat_write(),
        checker.check_background_workers(),
        checker.check_network("https://api.example.com"),
    ];
    for decision in decisions {
        let denial = decision.unwrap_err();
        assert!(!denial.required.is_empty());
    }
}

#[test]
fn test_network_port_grant_is_exact() {
    let checker = checker(&["network:api.example.com:8443".to_string()]);
    assert!(checker.check_network("https://api.example.com:8443/v1").is_ok());

    let denial = checker
        .check_network("https://api.example.com/v1")
        .unwrap_err();
    assert_eq!(denial.required, "network:api.example.com:443");
}

#[test]
fn test_network_localhost_grant() {
    let checker = checker(&["network:localhost".to_string()]);
    assert!(checker.check_network("http://127.0.0.1:9000/").is_ok());
    assert!(checker.check_network("http://localhost:3000/").is_ok());
    assert!(checker.check_network("http://example.com/").is_err());
    // only http(s) is ever allowed
    assert!(checker.check_network("file:///etc/passwd").is_err());
}

#[test]
fn test_collection_access_requires_declaration() {
    let todos = CollectionDeclaration {
        name: "todos".into(),
        indexes: vec!["done".into()],
    };
    let grants = vec!["storage.local".to_string()];

    // storage.local alone is not enough without declared collections
    let undeclared = PermissionChecker::new(&grants, &[]);
    assert!(undeclared.check_storage().is_ok());
    assert_eq!(
        undeclared
            .validate_collection_access("todos")
            .unwrap_err()
            .required,
        "storage:todos"
    );

    let declared = PermissionChecker::new(&grants, &[todos.clone()]);
    assert!(declared.validate_collection_access("todos").is_ok());
    assert!(declared.validate_collection_access("notes").is_err());

    // declared, but no storage permission at all
    let no_perms = PermissionChecker::new(&[], &[todos.clone()]);
    assert!(no_perms.validate_collection_access("todos").is_err());

    let scoped = PermissionChecker::new(&["storage:todos".to_string()], &[todos]);
    assert!(scoped.validate_collection_access("todos").is_ok());
    assert!(scoped.check_storage().is_err());
}
