use std::sync::Arc;

use proptest::prelude::*;

use crate::{BackingStore, MemPager, MemoryConfig, MemoryStore, SwapStore};

const SECTOR: u64 = 512;
const MAX_SECTORS: u64 = 256;

#[derive(Debug, Clone)]
enum Op {
    Write { sector: u64, sectors: u64, fill: u8 },
    Read { sector: u64, sectors: u64 },
    Trim { sector: u64, sectors: u64 },
    Resize { sectors: u64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..MAX_SECTORS, 1u64..24, any::<u8>())
            .prop_map(|(sector, sectors, fill)| Op::Write { sector, sectors, fill }),
        4 => (0..MAX_SECTORS, 1u64..24).prop_map(|(sector, sectors)| Op::Read { sector, sectors }),
        1 => (0..MAX_SECTORS, 1u64..24).prop_map(|(sector, sectors)| Op::Trim { sector, sectors }),
        1 => (1..=MAX_SECTORS).prop_map(|sectors| Op::Resize { sectors }),
    ]
}

fn page_size_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![Just(512usize), Just(1024usize), Just(4096usize), Just(16 * 1024usize)]
}

/// Checks a store against a flat `Vec<u8>` model.
///
/// Trimmed ranges may read back as zero or as their old contents, so the model forgets them
/// and the checker only compares bytes whose value is known.
fn run(mut store: BackingStore, ops: Vec<Op>) -> Result<(), TestCaseError> {
    let mut model: Vec<Option<u8>> = vec![Some(0); store.len() as usize];
    for op in ops {
        let len = model.len() as u64 / SECTOR;
        match op {
            Op::Write { sector, sectors, fill } => {
                if sector + sectors > len {
                    continue;
                }
                let data = vec![fill ^ (sector as u8); (sectors * SECTOR) as usize];
                store.write_at(sector * SECTOR, &data).unwrap();
                let start = (sector * SECTOR) as usize;
                for (i, b) in data.iter().enumerate() {
                    model[start + i] = Some(*b);
                }
            }
            Op::Read { sector, sectors } => {
                if sector + sectors > len {
                    continue;
                }
                let got = store.read(sector * SECTOR, (sectors * SECTOR) as usize).unwrap();
                let start = (sector * SECTOR) as usize;
                for (i, b) in got.iter().enumerate() {
                    if let Some(expected) = model[start + i] {
                        prop_assert_eq!(*b, expected, "byte {} differs", start + i);
                    }
                }
            }
            Op::Trim { sector, sectors } => {
                if sector + sectors > len {
                    continue;
                }
                store.trim(sector * SECTOR, sectors * SECTOR).unwrap();
                let start = (sector * SECTOR) as usize;
                let end = start + (sectors * SECTOR) as usize;
                for b in &mut model[start..end] {
                    if *b != Some(0) {
                        *b = None;
                    }
                }
            }
            Op::Resize { sectors } => {
                store.resize(sectors * SECTOR).unwrap();
                model.resize((sectors * SECTOR) as usize, Some(0));
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn memory_store_matches_flat_model(
        page_size in page_size_strategy(),
        compress in any::<bool>(),
        ops in prop::collection::vec(op_strategy(), 1..64),
    ) {
        let store = MemoryStore::new(MemoryConfig {
            page_size,
            compress,
            ..MemoryConfig::new(MAX_SECTORS * SECTOR)
        })
        .unwrap();
        run(BackingStore::Malloc(store), ops)?;
    }

    #[test]
    fn swap_store_matches_flat_model(
        page_size in page_size_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..64),
    ) {
        let pager = Arc::new(MemPager::new(page_size));
        let store = SwapStore::new(pager, MAX_SECTORS * SECTOR).unwrap();
        run(BackingStore::Swap(store), ops)?;
    }
}
