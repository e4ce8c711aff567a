use std::io::{Cursor, Read, Write};

use patchfield_core::{FieldView, GibbsField, Item, Map, MapConfig, Position};
use patchfield_storage::{read_snapshot, write_snapshot, PatchPayloadCodec, SnapshotError};
use rand::RngCore;

/// Per-patch payload tracked by the test embedder.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Moisture(u32);

struct MoistureCodec;

impl PatchPayloadCodec for MoistureCodec {
    type Payload = Moisture;

    fn write_payload<W: Write>(
        &mut self,
        payload: &Moisture,
        out: &mut W,
    ) -> Result<(), SnapshotError> {
        out.write_all(&payload.0.to_le_bytes())?;
        Ok(())
    }

    fn read_payload<R: Read>(&mut self, input: &mut R) -> Result<Moisture, SnapshotError> {
        let mut bytes = [0u8; 4];
        input.read_exact(&mut bytes)?;
        Ok(Moisture(u32::from_le_bytes(bytes)))
    }
}

/// Trivial always-accept field: scatters items over the cells it resamples
/// and waters the patches it visits.
struct ScatterField {
    item_type: u32,
}

impl GibbsField<Moisture> for ScatterField {
    fn sample<R: RngCore>(
        &mut self,
        view: &mut FieldView<'_, Moisture>,
        positions: &[Position],
        rng: &mut R,
    ) {
        for &position in positions {
            view.iterate_neighborhoods(position, rng, |view, rng, cell_x, cell_y, scope| {
                let n = i64::from(view.n());
                let center = scope[0];
                let location = Position::new(
                    center.x * n + i64::from(cell_x),
                    center.y * n + i64::from(cell_y),
                );
                let keep = rng.next_u32() % 8 == 0;
                let patch = view.patch_mut(center).expect("scheduled patch exists");
                if patch.fixed() {
                    return;
                }
                patch.data_mut().0 += 1;
                let occupied = patch.items().iter().any(|item| item.location == location);
                if keep && !occupied {
                    patch
                        .items_mut()
                        .push(Item::new(self.item_type, location, 0, 0));
                }
            });
        }
    }
}

fn scatter_world(seed: u64) -> Map<Moisture, ScatterField> {
    Map::new(
        MapConfig {
            patch_size: 8,
            gibbs_iterations: 10,
            rng_seed: Some(seed),
        },
        ScatterField { item_type: 0 },
    )
    .expect("config is valid")
}

fn world_state(map: &Map<Moisture, ScatterField>) -> Vec<(Position, bool, Vec<Item>, Moisture)> {
    let mut state: Vec<_> = map
        .patches()
        .map(|(position, patch)| {
            (
                position,
                patch.fixed(),
                patch.items().to_vec(),
                *patch.data(),
            )
        })
        .collect();
    state.sort_by_key(|(position, _, _, _)| *position);
    state
}

fn snapshot(map: &Map<Moisture, ScatterField>) -> Vec<u8> {
    let mut buffer = Vec::new();
    write_snapshot(map, &mut MoistureCodec, &mut buffer).expect("snapshot writes");
    buffer
}

#[test]
fn round_trip_preserves_the_world() {
    let mut original = scatter_world(42);
    original.get_fixed_neighborhood(Position::new(0, 0));
    original.get_fixed_neighborhood(Position::new(40, -40));

    let buffer = snapshot(&original);
    let restored = read_snapshot(
        &mut Cursor::new(&buffer),
        &mut MoistureCodec,
        ScatterField { item_type: 0 },
    )
    .expect("snapshot reads");

    assert_eq!(restored.patch_size(), original.patch_size());
    assert_eq!(restored.gibbs_iterations(), original.gibbs_iterations());
    assert_eq!(restored.rng(), original.rng());
    assert_eq!(restored.patch_count(), original.patch_count());
    assert_eq!(world_state(&restored), world_state(&original));
}

#[test]
fn item_order_within_patches_is_stable_across_round_trips() {
    let mut original = scatter_world(42);
    original.get_fixed_neighborhood(Position::new(0, 0));

    let buffer = snapshot(&original);
    let restored = read_snapshot(
        &mut Cursor::new(&buffer),
        &mut MoistureCodec,
        ScatterField { item_type: 0 },
    )
    .expect("snapshot reads");

    let mut before = Vec::new();
    original.get_items(Position::new(-8, -8), Position::new(7, 7), &mut before);
    let mut after = Vec::new();
    restored.get_items(Position::new(-8, -8), Position::new(7, 7), &mut after);
    assert!(!before.is_empty());
    assert_eq!(before, after);
}

#[test]
fn restored_worlds_evolve_identically() {
    let mut original = scatter_world(42);
    original.get_fixed_neighborhood(Position::new(0, 0));

    let buffer = snapshot(&original);
    let mut restored = read_snapshot(
        &mut Cursor::new(&buffer),
        &mut MoistureCodec,
        ScatterField { item_type: 0 },
    )
    .expect("snapshot reads");

    original.get_fixed_neighborhood(Position::new(100, 100));
    restored.get_fixed_neighborhood(Position::new(100, 100));

    assert_eq!(world_state(&restored), world_state(&original));
    assert_eq!(restored.rng(), original.rng());

    let mut from_original = Vec::new();
    original.get_items(Position::new(92, 92), Position::new(107, 107), &mut from_original);
    let mut from_restored = Vec::new();
    restored.get_items(Position::new(92, 92), Position::new(107, 107), &mut from_restored);
    assert_eq!(from_original, from_restored);
}

#[test]
fn truncated_snapshots_fail_to_restore() {
    let mut original = scatter_world(42);
    original.get_fixed_neighborhood(Position::new(0, 0));
    let buffer = snapshot(&original);

    for len in [0, 4, buffer.len() / 2, buffer.len() - 1] {
        let result = read_snapshot::<Moisture, ScatterField, _, _>(
            &mut Cursor::new(&buffer[..len]),
            &mut MoistureCodec,
            ScatterField { item_type: 0 },
        );
        assert!(
            matches!(result, Err(SnapshotError::Io(_))),
            "prefix of {len} bytes should fail with an i/o error"
        );
    }
}
