#![forbid(unsafe_code)]

use super::LockId;

impl LockId {
    pub const MAIN_DOM: LockId = LockId::new(-1000);
    pub const SERVERS: LockId = LockId::new(-331);
    pub const CONTENT_TYPES: LockId = LockId::new(-332);
    pub const CONTENT_TREE: LockId = LockId::new(-333);
    pub const MEDIA_TREE: LockId = LockId::new(-334);
    pub const MEMBER_TREE: LockId = LockId::new(-335);
    pub const MEDIA_TYPES: LockId = LockId::new(-336);
    pub const MEMBER_TYPES: LockId = LockId::new(-337);
    pub const DOMAINS: LockId = LockId::new(-338);
    pub const KEY_VALUES: LockId = LockId::new(-339);
    pub const LANGUAGES: LockId = LockId::new(-340);
    pub const SCHEDULED_PUBLISHING: LockId = LockId::new(-341);
}

/// Well-known locks. Each one must exist as a row of the lock table before
/// anything can be locked against it.
pub const REGISTRY: &[(LockId, &str)] = &[
    (LockId::MAIN_DOM, "main-dom"),
    (LockId::SERVERS, "servers"),
    (LockId::CONTENT_TYPES, "content-types"),
    (LockId::CONTENT_TREE, "content-tree"),
    (LockId::MEDIA_TREE, "media-tree"),
    (LockId::MEMBER_TREE, "member-tree"),
    (LockId::MEDIA_TYPES, "media-types"),
    (LockId::MEMBER_TYPES, "member-types"),
    (LockId::DOMAINS, "domains"),
    (LockId::KEY_VALUES, "key-values"),
    (LockId::LANGUAGES, "languages"),
    (LockId::SCHEDULED_PUBLISHING, "scheduled-publishing"),
];

pub fn registered_ids() -> impl Iterator<Item = LockId> {
    REGISTRY.iter().map(|(id, _)| *id)
}
