//! Session registry integration tests - active pointer semantics

use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sf_org_core::config::SessionConfig;
use sf_org_core::session::AccessToken;
use sf_org_core::{Error, OrgId, RetryExecutor, RetryPolicy, Session, SessionRegistry};

fn registry() -> SessionRegistry {
    let config = SessionConfig {
        max_sessions: 64,
        ..SessionConfig::default()
    };
    SessionRegistry::new(config, RetryExecutor::new(RetryPolicy::no_retry())).unwrap()
}

fn session(org: &str) -> Session {
    Session::new(
        org,
        org,
        format!("https://{org}.my.salesforce.com"),
        "62.0",
        AccessToken::new("token"),
    )
}

#[test]
fn test_register_switch_evict_scenario() {
    let registry = registry();
    registry.register(session("A"));
    registry.register(session("B"));
    assert_eq!(registry.active(), Some(OrgId::from("A")));

    registry.set_active(&OrgId::from("B")).unwrap();
    registry.evict(&OrgId::from("A"));

    assert_eq!(registry.get(None).unwrap().org.as_str(), "B");
    assert!(matches!(
        registry.get(Some(&OrgId::from("A"))),
        Err(Error::UnknownOrg(_))
    ));
}

#[test]
fn test_active_pointer_matches_model_for_random_sequences() {
    let orgs = ["A", "B", "C", "D"];

    for seed in 0..50 {
        let mut rng = StdRng::seed_from_u64(seed);
        let registry = registry();
        let mut registered: Vec<&str> = Vec::new();
        let mut active: Option<&str> = None;

        for _ in 0..100 {
            let org = orgs[rng.random_range(0..orgs.len())];
            let id = OrgId::from(org);
            match rng.random_range(0..3) {
                0 => {
                    registry.register(session(org));
                    if !registered.contains(&org) {
                        registered.push(org);
                    }
                    if active.is_none() {
                        active = Some(org);
                    }
                }
                1 => {
                    let result = registry.set_active(&id);
                    if registered.contains(&org) {
                        assert!(result.is_ok());
                        active = Some(org);
                    } else {
                        assert!(matches!(result, Err(Error::UnknownOrg(_))));
                    }
                }
                _ => {
                    let evicted = registry.evict(&id);
                    assert_eq!(evicted.is_some(), registered.contains(&org));
                    registered.retain(|o| *o != org);
                    if active == Some(org) {
                        active = None;
                    }
                }
            }

            match active {
                Some(expected) => assert_eq!(registry.get(None).unwrap().org.as_str(), expected),
                None => assert!(matches!(registry.get(None), Err(Error::NoActiveSession))),
            }
            assert_eq!(registry.len(), registered.len());
        }
    }
}

#[test]
fn test_set_active_is_visible_to_every_later_reader() {
    let registry = Arc::new(registry());
    for org in ["A", "B", "C"] {
        registry.register(session(org));
    }

    for target in ["B", "C", "A", "C"] {
        registry.set_active(&OrgId::from(target)).unwrap();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.get(None).unwrap().org)
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.join().unwrap().as_str(), target);
        }
    }
}

#[test]
fn test_concurrent_churn_keeps_registry_consistent() {
    let registry = Arc::new(registry());
    registry.register(session("A"));
    registry.register(session("B"));

    let writer = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for _ in 0..500 {
                registry.evict(&OrgId::from("A"));
                registry.register(session("A"));
                registry.set_active(&OrgId::from("A")).unwrap();
            }
        })
    };
    let reader = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for _ in 0..2000 {
                match registry.get(None) {
                    Ok(session) => assert!(["A", "B"].contains(&session.org.as_str())),
                    Err(Error::NoActiveSession) => {}
                    Err(other) => panic!("unexpected {other}"),
                }
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();
    assert_eq!(registry.len(), 2);
}
