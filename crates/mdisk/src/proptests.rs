use std::sync::mpsc;
use std::time::Duration;

use proptest::prelude::*;

use crate::{Collaborators, Completion, DeviceConfig, DriverConfig, MdDriver, Request, RequestKind};

const SECTOR: u64 = 512;
const SECTORS: u64 = 64;

#[derive(Debug, Clone)]
enum Op {
    Write { sector: u64, sectors: u64, fill: u8 },
    Read { sector: u64, sectors: u64 },
    Delete { sector: u64, sectors: u64 },
    Flush,
}

impl Op {
    fn kind(&self) -> RequestKind {
        match self {
            Op::Write { .. } => RequestKind::Write,
            Op::Read { .. } => RequestKind::Read,
            Op::Delete { .. } => RequestKind::Delete,
            Op::Flush => RequestKind::Flush,
        }
    }

    /// Byte range touched, or `None` for a flush.
    fn range(&self) -> Option<(u64, u64)> {
        match *self {
            Op::Write { sector, sectors, .. }
            | Op::Read { sector, sectors }
            | Op::Delete { sector, sectors } => Some((sector * SECTOR, (sector + sectors) * SECTOR)),
            Op::Flush => None,
        }
    }

    fn request(&self, completion: Completion) -> Request {
        match *self {
            Op::Write { sector, sectors, fill } => Request::write(
                sector * SECTOR,
                vec![fill; (sectors * SECTOR) as usize],
                completion,
            ),
            Op::Read { sector, sectors } => {
                Request::read(sector * SECTOR, vec![0; (sectors * SECTOR) as usize], completion)
            }
            Op::Delete { sector, sectors } => {
                Request::delete(sector * SECTOR, sectors * SECTOR, completion)
            }
            Op::Flush => Request::flush(completion),
        }
    }
}

// Ranges may run past the end of the unit; those requests fail without side effects.
fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..SECTORS, 1u64..9, any::<u8>())
            .prop_map(|(sector, sectors, fill)| Op::Write { sector, sectors, fill }),
        4 => (0..SECTORS, 1u64..9).prop_map(|(sector, sectors)| Op::Read { sector, sectors }),
        1 => (0..SECTORS, 1u64..9).prop_map(|(sector, sectors)| Op::Delete { sector, sectors }),
        1 => Just(Op::Flush),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn unit_executes_requests_in_submission_order(ops in prop::collection::vec(op_strategy(), 1..48)) {
        let driver = MdDriver::attach(DriverConfig::default(), Collaborators::default()).unwrap();
        let unit = driver.create(DeviceConfig::malloc(SECTORS * SECTOR)).unwrap();
        let device = driver.device(unit).unwrap();

        let (tx, rx) = mpsc::channel();
        for op in &ops {
            device.submit(op.request(Completion::sender(tx.clone()))).unwrap();
        }
        drop(tx);

        let media = SECTORS * SECTOR;
        let mut model = vec![0u8; media as usize];
        for op in &ops {
            let outcome = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            prop_assert_eq!(outcome.kind, op.kind());

            let Some((start, end)) = op.range() else {
                prop_assert!(outcome.is_ok());
                continue;
            };
            prop_assert_eq!(outcome.offset, start);
            if end > media {
                prop_assert!(outcome.result.is_err(), "{:?} past the end succeeded", op);
                continue;
            }
            prop_assert!(outcome.is_ok(), "{:?} failed: {:?}", op, outcome.result);

            let range = start as usize..end as usize;
            match *op {
                Op::Write { fill, .. } => model[range].fill(fill),
                Op::Delete { .. } => model[range].fill(0),
                Op::Read { .. } => prop_assert_eq!(&outcome.data[..], &model[range]),
                Op::Flush => {}
            }
        }
        prop_assert_eq!(device.stats().errors, ops
            .iter()
            .filter_map(Op::range)
            .filter(|(_, end)| *end > media)
            .count() as u64);
    }
}
