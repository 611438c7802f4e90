//! End-to-end save/load coverage over a small game-like object graph:
//! shared references, cycles, capsule back-references, amnesty values,
//! and corrupt-file recovery.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use keepsake::storage::envelope::{seal, SaveEnvelope};
use keepsake::{
    as_saveable, saveable, AttributeStore, Capsule, CapsuleId, Encoding, Loader, RefListSlot,
    RefSlot, ReferenceId, Saveable, SaveableArray, SaveableRef, SaveableRegistry, Saver, Storage,
    StorageError, StoragePaths,
};

/// A linkable item; links may form cycles or point back at the capsule.
#[derive(Default)]
struct Gadget {
    name: String,
    link: Option<SaveableRef>,
    link_slot: RefSlot,
}

impl Saveable for Gadget {
    fn save(&self, saver: &mut Saver<'_>) {
        saver.value("name", &self.name);
        if let Some(link) = &self.link {
            saver.reference_dyn("link", link);
        }
    }

    fn load(&mut self, loader: &mut Loader<'_>) {
        self.name = loader.value("name").unwrap_or_default();
        self.link_slot = loader.reference("link");
    }

    fn load_completed(&mut self) {
        self.link = self.link_slot.take();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct Player {
    level: i32,
    slots: Vec<i64>,
    gadgets: Vec<SaveableRef>,
    gadgets_slot: RefListSlot,
}

impl Saveable for Player {
    fn save(&self, saver: &mut Saver<'_>) {
        saver.value("level", &self.level);
        saver.value("slots", &SaveableArray::from_values(&self.slots).unwrap());
        saver.references("gadgets", &self.gadgets);
    }

    fn load(&mut self, loader: &mut Loader<'_>) {
        self.level = loader.value("level").unwrap_or_default();
        self.slots = loader
            .value::<SaveableArray>("slots")
            .map(|array| array.to_values().unwrap())
            .unwrap_or_default();
        self.gadgets_slot = loader.references("gadgets");
    }

    fn load_completed(&mut self) {
        self.gadgets = self.gadgets_slot.get();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Capsule for Player {
    fn capsule_id(&self) -> CapsuleId {
        CapsuleId::new("player").unwrap()
    }
}

fn registry() -> Rc<SaveableRegistry> {
    let mut registry = SaveableRegistry::new();
    registry.register::<Gadget>(1, "game::Gadget").unwrap();
    Rc::new(registry)
}

fn storage_at(root: &std::path::Path, encoding: Encoding) -> Storage {
    Storage::new(StoragePaths::new(root), encoding, registry())
}

fn gadget(name: &str) -> Rc<RefCell<Gadget>> {
    saveable(Gadget {
        name: name.to_string(),
        ..Gadget::default()
    })
}

fn gadget_name(object: &SaveableRef) -> String {
    object
        .borrow()
        .as_any()
        .downcast_ref::<Gadget>()
        .unwrap()
        .name
        .clone()
}

fn gadget_link(object: &SaveableRef) -> Option<SaveableRef> {
    object
        .borrow()
        .as_any()
        .downcast_ref::<Gadget>()
        .unwrap()
        .link
        .clone()
}

#[test]
fn values_and_references_roundtrip_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = storage_at(dir.path(), Encoding::None);

    let sword = gadget("sword");
    let shield = gadget("shield");
    let player = saveable(Player {
        level: 3,
        slots: vec![1, 2, 3],
        gadgets: vec![as_saveable(&sword), as_saveable(&shield)],
        ..Player::default()
    });
    storage.add_capsule(player).unwrap();
    storage.save(true, &[]).unwrap();

    // Reload into a fresh storage over the same root.
    let mut reopened = storage_at(dir.path(), Encoding::None);
    let restored = saveable(Player::default());
    reopened.add_capsule(restored.clone()).unwrap();
    reopened.load(&[]).unwrap();

    let restored = restored.borrow();
    assert_eq!(restored.level, 3);
    assert_eq!(restored.slots, vec![1, 2, 3]);
    assert_eq!(restored.gadgets.len(), 2);
    assert_eq!(gadget_name(&restored.gadgets[0]), "sword");
    assert_eq!(gadget_name(&restored.gadgets[1]), "shield");
}

#[test]
fn base64_encoding_roundtrips_and_hides_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = storage_at(dir.path(), Encoding::Base64);

    let amulet = gadget("amulet");
    let player = saveable(Player {
        level: 9,
        gadgets: vec![as_saveable(&amulet)],
        ..Player::default()
    });
    storage.add_capsule(player).unwrap();
    storage.save(true, &[]).unwrap();

    let text = std::fs::read_to_string(dir.path().join("player.ksf")).unwrap();
    assert!(!text.contains("amulet"));

    let mut reopened = storage_at(dir.path(), Encoding::Base64);
    let restored = saveable(Player::default());
    reopened.add_capsule(restored.clone()).unwrap();
    reopened.load(&[]).unwrap();
    assert_eq!(restored.borrow().level, 9);
    assert_eq!(gadget_name(&restored.borrow().gadgets[0]), "amulet");
}

#[test]
fn shared_objects_keep_one_identity() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = storage_at(dir.path(), Encoding::None);

    let shared = gadget("lantern");
    let player = saveable(Player {
        gadgets: vec![as_saveable(&shared), as_saveable(&shared)],
        ..Player::default()
    });
    storage.add_capsule(player).unwrap();
    storage.save(true, &[]).unwrap();

    let mut reopened = storage_at(dir.path(), Encoding::None);
    let restored = saveable(Player::default());
    reopened.add_capsule(restored.clone()).unwrap();
    reopened.load(&[]).unwrap();

    let restored = restored.borrow();
    assert_eq!(restored.gadgets.len(), 2);
    assert!(Rc::ptr_eq(&restored.gadgets[0], &restored.gadgets[1]));
}

#[test]
fn reference_cycles_survive_a_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = storage_at(dir.path(), Encoding::None);

    let ping = gadget("ping");
    let pong = gadget("pong");
    ping.borrow_mut().link = Some(as_saveable(&pong));
    pong.borrow_mut().link = Some(as_saveable(&ping));

    let player = saveable(Player {
        gadgets: vec![as_saveable(&ping)],
        ..Player::default()
    });
    storage.add_capsule(player).unwrap();
    storage.save(true, &[]).unwrap();

    let mut reopened = storage_at(dir.path(), Encoding::None);
    let restored = saveable(Player::default());
    reopened.add_capsule(restored.clone()).unwrap();
    reopened.load(&[]).unwrap();

    let restored = restored.borrow();
    let ping = &restored.gadgets[0];
    let pong = gadget_link(ping).unwrap();
    assert_eq!(gadget_name(&pong), "pong");
    let back = gadget_link(&pong).unwrap();
    assert!(Rc::ptr_eq(&back, ping));
}

#[test]
fn capsule_back_reference_resolves_to_the_root() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = storage_at(dir.path(), Encoding::None);

    let badge = gadget("badge");
    let player = saveable(Player {
        gadgets: vec![as_saveable(&badge)],
        ..Player::default()
    });
    badge.borrow_mut().link = Some(as_saveable(&player));
    storage.add_capsule(player).unwrap();
    storage.save(true, &[]).unwrap();

    let mut reopened = storage_at(dir.path(), Encoding::None);
    let restored = saveable(Player::default());
    reopened.add_capsule(restored.clone()).unwrap();
    reopened.load(&[]).unwrap();

    let back = {
        let guard = restored.borrow();
        gadget_link(&guard.gadgets[0]).unwrap()
    };
    assert!(Rc::ptr_eq(&back, &as_saveable(&restored)));
}

#[test]
fn identities_are_stable_across_unchanged_saves() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = storage_at(dir.path(), Encoding::None);

    let player = saveable(Player {
        level: 1,
        gadgets: vec![as_saveable(&gadget("a")), as_saveable(&gadget("b"))],
        ..Player::default()
    });
    storage.add_capsule(player).unwrap();

    storage.save(true, &[]).unwrap();
    let first = std::fs::read_to_string(dir.path().join("player.ksf")).unwrap();
    storage.save(true, &[]).unwrap();
    let second = std::fs::read_to_string(dir.path().join("player.ksf")).unwrap();
    assert_eq!(first, second);
}

#[test]
fn unregistered_reachable_type_fails_the_save() {
    #[derive(Default)]
    struct Rogue;
    impl Saveable for Rogue {
        fn save(&self, _saver: &mut Saver<'_>) {}
        fn load(&mut self, _loader: &mut Loader<'_>) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut storage = storage_at(dir.path(), Encoding::None);
    let rogue = saveable(Rogue);
    let player = saveable(Player {
        gadgets: vec![as_saveable(&rogue)],
        ..Player::default()
    });
    storage.add_capsule(player).unwrap();

    assert!(matches!(
        storage.save(false, &[]),
        Err(StorageError::UnregisteredType { .. })
    ));
}

#[test]
fn cross_capsule_reference_is_rejected() {
    #[derive(Default)]
    struct Settings;
    impl Saveable for Settings {
        fn save(&self, _saver: &mut Saver<'_>) {}
        fn load(&mut self, _loader: &mut Loader<'_>) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
    }
    impl Capsule for Settings {
        fn capsule_id(&self) -> CapsuleId {
            CapsuleId::new("settings").unwrap()
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut storage = storage_at(dir.path(), Encoding::None);

    let settings = saveable(Settings);
    let spy = gadget("spy");
    spy.borrow_mut().link = Some(as_saveable(&settings));
    let player = saveable(Player {
        gadgets: vec![as_saveable(&spy)],
        ..Player::default()
    });
    storage.add_capsule(player).unwrap();
    storage.add_capsule(settings).unwrap();

    assert!(matches!(
        storage.save(false, &[]),
        Err(StorageError::CrossCapsuleReference { .. })
    ));
}

#[test]
fn injected_amnesty_value_survives_disk_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = storage_at(dir.path(), Encoding::None);
    let player = saveable(Player {
        level: 4,
        ..Player::default()
    });
    storage.add_capsule(player).unwrap();
    storage.save(true, &[]).unwrap();

    // Bind the capsule to its cached store, the way a running game would
    // be before an external edit lands.
    storage.load(&[]).unwrap();
    let capsule_id = CapsuleId::new("player").unwrap();
    let root = storage.editable_ref(&capsule_id, &ReferenceId::root()).unwrap();
    root.borrow_mut().set_value("achievement", &true).unwrap();
    storage.flush(&[]).unwrap();

    // A save pass that never writes the key keeps it.
    storage.save(true, &[]).unwrap();
    storage.refresh(&[]).unwrap();
    let root = storage.editable_ref(&capsule_id, &ReferenceId::root()).unwrap();
    assert_eq!(root.borrow().get::<bool>("achievement").unwrap(), Some(true));
}

#[test]
fn dangling_reference_loads_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let capsule_id = CapsuleId::new("player").unwrap();

    // Handcraft a file whose root references an entry that is not there.
    let mut root_store = AttributeStore::new(capsule_id.clone());
    root_store.set_references("gadgets", &[ReferenceId::from_counter(5)]);
    let mut stores = BTreeMap::new();
    stores.insert(ReferenceId::root(), root_store);
    let text = seal(&SaveEnvelope::build(&capsule_id, &stores), Encoding::None).unwrap();
    std::fs::write(StoragePaths::new(dir.path()).capsule_file(&capsule_id), text).unwrap();

    let mut storage = storage_at(dir.path(), Encoding::None);
    let restored = saveable(Player::default());
    storage.add_capsule(restored.clone()).unwrap();
    storage.load(&[]).unwrap();
    assert!(restored.borrow().gadgets.is_empty());
}

#[test]
fn corrupt_file_degrades_to_an_empty_capsule() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = storage_at(dir.path(), Encoding::None);
    let player = saveable(Player {
        level: 8,
        ..Player::default()
    });
    storage.add_capsule(player).unwrap();
    storage.save(true, &[]).unwrap();

    // Flip bytes inside the payload without touching the token.
    let path = dir.path().join("player.ksf");
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replace("level", "lovel")).unwrap();

    let mut reopened = storage_at(dir.path(), Encoding::None);
    let restored = saveable(Player::default());
    reopened.add_capsule(restored.clone()).unwrap();
    reopened.load(&[]).unwrap();
    assert_eq!(restored.borrow().level, 0);
}
