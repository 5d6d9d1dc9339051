use commons_core::{CommonsConfig, Epoch, Param, Turn, World};

fn seeded_config(seed: u64) -> CommonsConfig {
    CommonsConfig {
        start_population: 80,
        start_resources: 256,
        rng_seed: Some(seed),
        stats_interval: 5,
        history_capacity: 128,
        ..CommonsConfig::default()
    }
}

#[test]
fn seeded_worlds_advance_deterministically() {
    let config = CommonsConfig {
        start_population: 40,
        start_resources: 128,
        rng_seed: Some(0xDEAD_BEEF),
        stats_interval: 1,
        history_capacity: 64,
        ..CommonsConfig::default()
    };

    let mut world_a = World::new(config.clone()).expect("world_a");
    let mut world_b = World::new(config).expect("world_b");

    for _ in 0..40 {
        world_a.step().expect("step a");
        world_b.step().expect("step b");
    }

    assert_eq!(world_a.turn(), Turn(40));
    assert_eq!(
        world_a.people().alive_count(),
        world_b.people().alive_count()
    );
    assert_eq!(
        world_a.people().total_count(),
        world_b.people().total_count()
    );
    assert_eq!(world_a.resources().total(), world_b.resources().total());
    assert_eq!(
        world_a.relationships().edge_count(),
        world_b.relationships().edge_count()
    );
    assert!(world_a.history().eq(world_b.history()));
}

#[test]
fn lifecycle_invariants_hold_over_a_long_run() {
    let mut world = World::new(seeded_config(9)).expect("world");
    let cap = world.config().max_relationships as usize;

    for _ in 0..120 {
        world.step().expect("step");

        for (id, person) in world.people().iter() {
            assert!(person.stockpile >= 0.0, "negative stockpile");
            assert!(person.relationships.len() <= cap, "relationship cap broken");
            assert!(!person.relationships.contains(&id), "self relationship");
            if !person.alive {
                assert_eq!(person.stockpile, 0.0, "dead with stockpile");
                assert!(person.died.is_some());
                assert!(person.cause.is_some());
                assert!(
                    !world.people().alive_ids().contains(&id),
                    "dead person in alive subset"
                );
            }
        }
        for edge in world.relationships().edges() {
            assert!((0.0..=1.0).contains(&edge.debt()), "debt out of range");
            assert_ne!(edge.from, edge.to, "self edge");
        }
        for &id in world.people().alive_ids() {
            assert!(world.people().is_alive(id));
        }
    }

    assert!(world.people().total_count() >= 80);
    assert!(world.history().count() > 0);
}

#[test]
fn epoch_overrides_are_visible_during_their_range() {
    let mut world = World::new(CommonsConfig {
        start_population: 10,
        start_resources: 64,
        rng_seed: Some(21),
        stats_interval: 0,
        ..CommonsConfig::default()
    })
    .expect("world");
    world.add_epoch(Epoch::new(10, 20, vec![(Param::NeedPerTurn, 4.0)]));

    for _ in 0..30 {
        let events = world.step().expect("step");
        let in_range = (10..=20).contains(&events.turn.0);
        assert_eq!(events.epoch_active, in_range, "turn {}", events.turn.0);
        let expected = if in_range { 4.0 } else { 2.0 };
        assert_eq!(
            world.params().get(Param::NeedPerTurn),
            expected,
            "turn {}",
            events.turn.0
        );
    }
}

#[test]
fn snapshot_resume_continues_the_run() {
    let mut world = World::new(seeded_config(17)).expect("world");
    for _ in 0..15 {
        world.step().expect("step");
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = std::env::temp_dir().join(format!(
        "commons-resume-{}-{timestamp}.json",
        std::process::id()
    ));
    world.save_snapshot(&path).expect("save");

    let mut restored = World::load_snapshot(&path).expect("load");
    let _ = std::fs::remove_file(&path);

    assert_eq!(restored.turn(), Turn(15));
    assert_eq!(
        restored.people().alive_count(),
        world.people().alive_count()
    );

    for _ in 0..10 {
        restored.step().expect("resumed step");
    }
    assert_eq!(restored.turn(), Turn(25));
    assert!(restored.people().total_count() >= world.people().total_count());
}
