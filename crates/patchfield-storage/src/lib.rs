//! Snapshot codec for patchfield worlds.
//!
//! The layout is a fixed little-endian stream: the PRNG state as a
//! length-prefixed decimal string, the patch edge length, the Gibbs sweep
//! count, then the patch table as a count followed by one record per patch
//! (`position`, `fixed`, length-prefixed items, embedder payload). The
//! per-patch payload is delegated to a caller-supplied [`PatchPayloadCodec`];
//! the Gibbs field and its caches are not part of the snapshot and are
//! supplied fresh on restore.

use std::io::{self, Read, Write};

use patchfield_core::{GibbsField, Item, Map, MapError, MinstdRng, Patch, Position, RngStateError};
use thiserror::Error;
use tracing::debug;

/// Longest plausible textual PRNG state (a 31-bit decimal plus slack).
const MAX_RNG_STATE_LEN: u64 = 64;

/// Errors raised while writing or restoring a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot prng state is not valid utf-8")]
    RngStateEncoding,
    #[error("malformed prng state: {0}")]
    BadRngState(#[from] RngStateError),
    #[error("prng state length {0} exceeds the format limit")]
    RngStateTooLong(u64),
    #[error("invalid fixed-flag byte: {0}")]
    InvalidFlag(u8),
    #[error("snapshot does not describe a valid map: {0}")]
    Map(#[from] MapError),
}

/// Serialization of the opaque per-patch payload, supplied by the embedder.
pub trait PatchPayloadCodec {
    type Payload;

    /// Writes one payload to the stream.
    fn write_payload<W: Write>(
        &mut self,
        payload: &Self::Payload,
        out: &mut W,
    ) -> Result<(), SnapshotError>;

    /// Reads one payload back from the stream.
    fn read_payload<R: Read>(&mut self, input: &mut R) -> Result<Self::Payload, SnapshotError>;
}

/// Codec for worlds that carry no per-patch payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnitPayloadCodec;

impl PatchPayloadCodec for UnitPayloadCodec {
    type Payload = ();

    fn write_payload<W: Write>(&mut self, _payload: &(), _out: &mut W) -> Result<(), SnapshotError> {
        Ok(())
    }

    fn read_payload<R: Read>(&mut self, _input: &mut R) -> Result<(), SnapshotError> {
        Ok(())
    }
}

/// Writes a complete world snapshot to `out`.
///
/// The map must not be mutated while this runs; single-threaded embedders get
/// that for free from the shared borrow.
pub fn write_snapshot<D, F, C, W>(
    map: &Map<D, F>,
    codec: &mut C,
    out: &mut W,
) -> Result<(), SnapshotError>
where
    C: PatchPayloadCodec<Payload = D>,
    W: Write,
{
    let state = map.rng().state_string();
    write_u64(out, state.len() as u64)?;
    out.write_all(state.as_bytes())?;

    write_u32(out, map.patch_size())?;
    write_u32(out, map.gibbs_iterations())?;

    write_u64(out, map.patch_count() as u64)?;
    for (position, patch) in map.patches() {
        write_position(out, position)?;
        out.write_all(&[u8::from(patch.fixed())])?;
        write_u64(out, patch.items().len() as u64)?;
        for item in patch.items() {
            write_item(out, item)?;
        }
        codec.write_payload(patch.data(), out)?;
    }

    debug!(patches = map.patch_count(), "wrote world snapshot");
    Ok(())
}

/// Restores a world from a snapshot stream.
///
/// `field` replaces the Gibbs field of the serialized world; its caches are
/// rebuilt by the caller from the same item-type table, which is not part of
/// the snapshot.
pub fn read_snapshot<D, F, C, R>(
    input: &mut R,
    codec: &mut C,
    field: F,
) -> Result<Map<D, F>, SnapshotError>
where
    F: GibbsField<D>,
    C: PatchPayloadCodec<Payload = D>,
    R: Read,
{
    let state_len = read_u64(input)?;
    if state_len > MAX_RNG_STATE_LEN {
        return Err(SnapshotError::RngStateTooLong(state_len));
    }
    let mut state = vec![0u8; state_len as usize];
    input.read_exact(&mut state)?;
    let state = std::str::from_utf8(&state).map_err(|_| SnapshotError::RngStateEncoding)?;
    let rng = MinstdRng::from_state_string(state)?;

    let patch_size = read_u32(input)?;
    let gibbs_iterations = read_u32(input)?;

    let patch_count = read_u64(input)?;
    let mut patches = Vec::with_capacity(patch_count.min(65_536) as usize);
    for _ in 0..patch_count {
        let position = read_position(input)?;
        let fixed = read_flag(input)?;
        let item_count = read_u64(input)?;
        let mut items = Vec::with_capacity(item_count.min(65_536) as usize);
        for _ in 0..item_count {
            items.push(read_item(input)?);
        }
        let data = codec.read_payload(input)?;
        patches.push((position, Patch::from_parts(fixed, items, data)));
    }

    debug!(patches = patches.len(), "read world snapshot");
    Ok(Map::from_snapshot_parts(
        patch_size,
        gibbs_iterations,
        rng,
        patches,
        field,
    )?)
}

fn write_u32<W: Write>(out: &mut W, value: u32) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn write_u64<W: Write>(out: &mut W, value: u64) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn write_i64<W: Write>(out: &mut W, value: i64) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn write_position<W: Write>(out: &mut W, position: Position) -> io::Result<()> {
    write_i64(out, position.x)?;
    write_i64(out, position.y)
}

fn write_item<W: Write>(out: &mut W, item: &Item) -> io::Result<()> {
    write_u32(out, item.item_type)?;
    write_position(out, item.location)?;
    write_u64(out, item.creation_time)?;
    write_u64(out, item.deletion_time)
}

fn read_u32<R: Read>(input: &mut R) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64<R: Read>(input: &mut R) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_i64<R: Read>(input: &mut R) -> io::Result<i64> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(i64::from_le_bytes(bytes))
}

fn read_position<R: Read>(input: &mut R) -> io::Result<Position> {
    let x = read_i64(input)?;
    let y = read_i64(input)?;
    Ok(Position::new(x, y))
}

fn read_item<R: Read>(input: &mut R) -> io::Result<Item> {
    let item_type = read_u32(input)?;
    let location = read_position(input)?;
    let creation_time = read_u64(input)?;
    let deletion_time = read_u64(input)?;
    Ok(Item::new(item_type, location, creation_time, deletion_time))
}

fn read_flag<R: Read>(input: &mut R) -> Result<bool, SnapshotError> {
    let mut byte = [0u8; 1];
    input.read_exact(&mut byte)?;
    match byte[0] {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(SnapshotError::InvalidFlag(other)),
    }
}
