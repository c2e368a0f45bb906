use super::*;

#[test]
fn acquisition_order_is_ascending_and_deduplicated() {
    let entries = [
        LockEntry::write(LockId::new(5)),
        LockEntry::write(LockId::new(1)),
        LockEntry::write(LockId::new(3)),
        LockEntry::write(LockId::new(1)),
    ];
    assert_eq!(
        acquisition_order(&entries),
        vec![
            LockEntry::write(LockId::new(1)),
            LockEntry::write(LockId::new(3)),
            LockEntry::write(LockId::new(5)),
        ]
    );
}

#[test]
fn mixed_modes_for_one_id_merge_into_the_stronger() {
    let entries = [
        LockEntry::read(LockId::SERVERS),
        LockEntry::read(LockId::MAIN_DOM),
        LockEntry::write(LockId::SERVERS),
        LockEntry::read(LockId::KEY_VALUES),
    ];
    assert_eq!(
        acquisition_order(&entries),
        vec![
            LockEntry::read(LockId::MAIN_DOM),
            LockEntry::read(LockId::KEY_VALUES),
            LockEntry::write(LockId::SERVERS),
        ]
    );
}

#[test]
fn write_satisfies_read_but_not_the_other_way() {
    assert!(LockMode::Write.satisfies(LockMode::Read));
    assert!(LockMode::Write.satisfies(LockMode::Write));
    assert!(LockMode::Read.satisfies(LockMode::Read));
    assert!(!LockMode::Read.satisfies(LockMode::Write));
}

#[test]
fn lock_id_parse_accepts_numbers_and_names() {
    assert_eq!(LockId::parse("-331").unwrap(), LockId::SERVERS);
    assert_eq!(LockId::parse("servers").unwrap(), LockId::SERVERS);
    assert_eq!(LockId::parse("KEY_VALUES").unwrap(), LockId::KEY_VALUES);
    assert_eq!(LockId::parse("  ").unwrap_err(), LockIdError::Empty);
    assert_eq!(
        LockId::parse("nope").unwrap_err(),
        LockIdError::UnknownName("nope".to_string())
    );
}

#[test]
fn registry_ids_are_unique() {
    let unique = registered_ids().collect::<std::collections::BTreeSet<_>>();
    assert_eq!(unique.len(), REGISTRY.len());
    assert!(LockId::SERVERS.is_registered());
    assert!(!LockId::new(-666).is_registered());
    assert_eq!(LockId::SERVERS.to_string(), "-331(servers)");
    assert_eq!(LockId::new(-666).to_string(), "-666");
}
