//! Migrations running against real save files: cursor persistence across
//! process restarts, undo, and interaction with ordinary save passes.

use std::any::Any;
use std::rc::Rc;

use keepsake::migrate::StepError;
use keepsake::storage::ReadResult;
use keepsake::{
    saveable, Capsule, CapsuleId, Encoding, Loader, Migration, Migrator, Saveable,
    SaveableRegistry, Saver, Storage, StoragePaths,
};

#[derive(Default)]
struct Hero {
    // Renamed from "level" on disk by the first migration.
    xp_level: i32,
}

impl Saveable for Hero {
    fn save(&self, saver: &mut Saver<'_>) {
        saver.value("xp_level", &self.xp_level);
    }
    fn load(&mut self, loader: &mut Loader<'_>) {
        self.xp_level = loader.value("xp_level").unwrap_or_default();
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Capsule for Hero {
    fn capsule_id(&self) -> CapsuleId {
        CapsuleId::new("hero").unwrap()
    }
}

struct LevelBecomesXpLevel;

impl Migration for LevelBecomesXpLevel {
    fn capsule_id(&self) -> CapsuleId {
        CapsuleId::new("hero").unwrap()
    }
    fn apply(&self, capsule: &ReadResult) -> Result<(), StepError> {
        capsule
            .root
            .borrow_mut()
            .relocate_value("level", "xp_level")?;
        Ok(())
    }
    fn revert(&self, capsule: &ReadResult) -> Result<(), StepError> {
        capsule
            .root
            .borrow_mut()
            .relocate_value("xp_level", "level")?;
        Ok(())
    }
}

fn storage_at(root: &std::path::Path) -> Storage {
    Storage::new(
        StoragePaths::new(root),
        Encoding::None,
        Rc::new(SaveableRegistry::new()),
    )
}

/// Write a v1-era save file carrying the old "level" key.
fn write_legacy_save(root: &std::path::Path) {
    let mut storage = storage_at(root);
    storage.add_capsule(saveable(Hero::default())).unwrap();
    let capsule = storage
        .read_capsule(&CapsuleId::new("hero").unwrap())
        .unwrap();
    capsule.root.borrow_mut().set_value("level", &12i32).unwrap();
    storage.flush(&[]).unwrap();
}

#[test]
fn migrate_then_load_sees_the_new_schema() {
    let dir = tempfile::tempdir().unwrap();
    write_legacy_save(dir.path());

    let mut storage = storage_at(dir.path());
    let hero = saveable(Hero::default());
    storage.add_capsule(hero.clone()).unwrap();

    let migrator = Migrator::new().with_step(LevelBecomesXpLevel);
    migrator.run(&mut storage).unwrap();
    storage.load(&[]).unwrap();

    assert_eq!(hero.borrow().xp_level, 12);
}

#[test]
fn cursor_survives_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    write_legacy_save(dir.path());
    let migrator = Migrator::new().with_step(LevelBecomesXpLevel);

    {
        let mut storage = storage_at(dir.path());
        storage.add_capsule(saveable(Hero::default())).unwrap();
        migrator.run(&mut storage).unwrap();
    }

    // A second process runs the same migrator; the cursor stops it from
    // re-applying (which would clobber a freshly written "level" key).
    let mut storage = storage_at(dir.path());
    let hero = saveable(Hero::default());
    storage.add_capsule(hero.clone()).unwrap();
    let capsule = storage
        .read_capsule(&CapsuleId::new("hero").unwrap())
        .unwrap();
    capsule.root.borrow_mut().set_value("level", &99i32).unwrap();
    drop(capsule);
    storage.flush(&[]).unwrap();
    migrator.run(&mut storage).unwrap();

    let capsule = storage
        .read_capsule(&CapsuleId::new("hero").unwrap())
        .unwrap();
    assert_eq!(capsule.root.borrow().get::<i32>("level").unwrap(), Some(99));
    assert_eq!(
        capsule.root.borrow().get::<i32>("xp_level").unwrap(),
        Some(12)
    );
}

#[test]
fn undo_restores_the_old_schema_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    write_legacy_save(dir.path());
    let migrator = Migrator::new().with_step(LevelBecomesXpLevel);

    let mut storage = storage_at(dir.path());
    storage.add_capsule(saveable(Hero::default())).unwrap();
    migrator.run(&mut storage).unwrap();
    migrator.undo(&mut storage).unwrap();

    // Reopen from disk to prove the undo was flushed.
    let mut reopened = storage_at(dir.path());
    reopened.add_capsule(saveable(Hero::default())).unwrap();
    let capsule = reopened
        .read_capsule(&CapsuleId::new("hero").unwrap())
        .unwrap();
    assert_eq!(capsule.root.borrow().get::<i32>("level").unwrap(), Some(12));
    assert!(!capsule.root.borrow().has_value("xp_level"));
}

#[test]
fn migrated_value_survives_a_save_pass_that_ignores_it() {
    let dir = tempfile::tempdir().unwrap();
    write_legacy_save(dir.path());

    let mut storage = storage_at(dir.path());
    let hero = saveable(Hero::default());
    storage.add_capsule(hero.clone()).unwrap();
    let migrator = Migrator::new().with_step(LevelBecomesXpLevel);
    migrator.run(&mut storage).unwrap();
    storage.load(&[]).unwrap();

    // The cursor was written via the amnesty list, so a plain save pass
    // carries it forward even though Hero::save never mentions it.
    storage.save(true, &[]).unwrap();

    let mut reopened = storage_at(dir.path());
    reopened.add_capsule(saveable(Hero::default())).unwrap();
    migrator.run(&mut reopened).unwrap();
    let capsule = reopened
        .read_capsule(&CapsuleId::new("hero").unwrap())
        .unwrap();
    // Still migrated exactly once.
    assert_eq!(
        capsule.root.borrow().get::<i32>("xp_level").unwrap(),
        Some(12)
    );
}
