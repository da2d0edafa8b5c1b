pub mod error;

use chrono::NaiveDateTime;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::AcquisitionConfig;
use crate::devices::{MeterLink, RegisterSession};
use crate::registers::{self, RegisterMap};
use crate::storage::{DualSinkWriter, Header, LocalStore, PkError, PkSequencer, Record, RemoteStore};

pub use error::CycleError;

/// Where a cycle got to; logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Connected,
    Probed,
    Reading,
    Decoded,
}

/// Settings for the read sequence
#[derive(Debug, Clone, Copy)]
pub struct ReadPlan {
    pub probe_address: u16,
    pub probe_count: u16,
    pub read_delay: Duration,
}

impl From<&AcquisitionConfig> for ReadPlan {
    fn from(config: &AcquisitionConfig) -> Self {
        ReadPlan {
            probe_address: config.probe_address,
            probe_count: config.probe_count,
            read_delay: Duration::from_millis(config.read_delay_ms),
        }
    }
}

/// Closes the session when the cycle leaves scope, whichever way it leaves
struct SessionGuard<S: RegisterSession>(S);

impl<S: RegisterSession> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Reads every mapped register from the meter and decodes them in map order
pub struct AcquisitionPipeline<'a, M> {
    link: &'a M,
    map: &'a RegisterMap,
    plan: ReadPlan,
}

impl<'a, M: MeterLink> AcquisitionPipeline<'a, M> {
    pub fn new(link: &'a M, map: &'a RegisterMap, plan: ReadPlan) -> Self {
        AcquisitionPipeline { link, map, plan }
    }

    /// Runs `Idle` through `Decoded`; any failure discards the partial reading
    pub fn acquire(&self) -> Result<Vec<f64>, CycleError> {
        let mut state = CycleState::Idle;
        debug!("Cycle state {:?}", state);

        let session = self.link.connect().map_err(CycleError::DeviceUnavailable)?;
        let mut session = SessionGuard(session);
        state = advance(state, CycleState::Connected);

        session
            .0
            .read_holding_registers(self.plan.probe_address, self.plan.probe_count)
            .map_err(|e| {
                if e.is_protocol() {
                    error!("Meter answered the probe with an exception: {}", e);
                } else {
                    error!("Meter probe failed: {}", e);
                }
                CycleError::DeviceError(e)
            })?;
        state = advance(state, CycleState::Probed);
        state = advance(state, CycleState::Reading);

        let mut values = Vec::new();
        for (name, entry) in self.map.entries() {
            let raw = session
                .0
                .read_holding_registers(entry.address, entry.count)
                .map_err(|e| {
                    error!("Reading `{}` at register {} failed: {}", name, entry.address, e);
                    CycleError::DeviceError(e)
                })?;
            let decoded = registers::decode(entry, &raw).map_err(|source| {
                CycleError::InvalidPayloadLength {
                    field: name.clone(),
                    source,
                }
            })?;
            values.extend(decoded);
            std::thread::sleep(self.plan.read_delay);
        }

        advance(state, CycleState::Decoded);
        info!("Read {} values from {} registers", values.len(), self.map.len());
        Ok(values)
    }
}

fn advance(from: CycleState, to: CycleState) -> CycleState {
    debug!("Cycle state {:?} -> {:?}", from, to);
    to
}

/// Summary of a finished cycle
#[derive(Debug)]
pub struct CycleReport {
    pub pk: u64,
    pub remote_ok: Option<bool>,
}

/// Everything one cycle needs, borrowed from the caller
pub struct Cycle<'a, M, L, R> {
    pub link: &'a M,
    pub map: &'a RegisterMap,
    pub plan: ReadPlan,
    pub local: &'a L,
    pub remote: Option<&'a R>,
    /// Used only when the backup directory holds no records yet
    pub seed_pk: Option<u64>,
}

impl<M: MeterLink, L: LocalStore, R: RemoteStore> Cycle<'_, M, L, R> {
    /// Acquires, numbers and stores one record captured at `now`
    pub fn run(&self, now: NaiveDateTime) -> Result<CycleReport, CycleError> {
        info!("Starting acquisition cycle");
        let values = AcquisitionPipeline::new(self.link, self.map, self.plan).acquire()?;

        let pk = match PkSequencer::new(self.local).next_pk(now.date()) {
            Ok(pk) => pk,
            Err(PkError::NoPriorRecords) => match self.seed_pk {
                Some(seed) => {
                    info!("No prior records, starting at seeded PK {}", seed);
                    seed
                }
                None => {
                    error!("No prior records and no seed PK given");
                    return Err(CycleError::NoPriorRecords);
                }
            },
            Err(e) => {
                error!("Cannot derive next PK: {}", e);
                return Err(e.into());
            }
        };

        let record = Record {
            pk,
            timestamp: now,
            values,
        };
        let header = Header::for_map(self.map);
        let result = DualSinkWriter::new(self.local, self.remote, &header).commit(&record);

        let remote_ok = result.remote.as_ref().map(Result::is_ok);
        if let Err(e) = result.local {
            error!("Local backup of PK {} failed: {}", pk, e);
            return Err(CycleError::LocalWriteFailure(e));
        }

        info!("Cycle complete, PK {}", pk);
        Ok(CycleReport { pk, remote_ok })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::ModbusError;
    use crate::registers::RegisterMapEntry;
    use crate::storage::tests::{at, sample_map, MemoryStore};
    use crate::storage::CsvBackup;
    use crate::storage::writer::tests::MemoryRemote;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::io;
    use std::rc::Rc;

    type Reply = Result<Vec<u16>, ModbusError>;

    /// Meter double answering from a script and counting opens and closes
    #[derive(Default)]
    struct ScriptedLink {
        replies: RefCell<VecDeque<Reply>>,
        requests: Rc<RefCell<Vec<(u16, u16)>>>,
        closes: Rc<Cell<usize>>,
        unreachable: bool,
    }

    struct ScriptedSession {
        replies: VecDeque<Reply>,
        requests: Rc<RefCell<Vec<(u16, u16)>>>,
        closes: Rc<Cell<usize>>,
    }

    impl ScriptedLink {
        fn answering(replies: Vec<Reply>) -> Self {
            ScriptedLink {
                replies: RefCell::new(replies.into()),
                ..ScriptedLink::default()
            }
        }
    }

    impl MeterLink for ScriptedLink {
        type Session = ScriptedSession;

        fn connect(&self) -> Result<ScriptedSession, ModbusError> {
            if self.unreachable {
                return Err(ModbusError::Unavailable {
                    port: "/dev/null".to_string(),
                    reason: "no such device".to_string(),
                });
            }
            Ok(ScriptedSession {
                replies: self.replies.take(),
                requests: Rc::clone(&self.requests),
                closes: Rc::clone(&self.closes),
            })
        }
    }

    impl RegisterSession for ScriptedSession {
        fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
            self.requests.borrow_mut().push((address, count));
            self.replies.pop_front().unwrap_or_else(|| {
                Err(ModbusError::Io(io::Error::new(io::ErrorKind::TimedOut, "script exhausted")))
            })
        }

        fn close(&mut self) {
            self.closes.set(self.closes.get() + 1);
        }
    }

    fn plan() -> ReadPlan {
        ReadPlan {
            probe_address: 0,
            probe_count: 2,
            read_delay: Duration::ZERO,
        }
    }

    fn exception() -> Reply {
        Err(ModbusError::Protocol { function: 3, code: 2 })
    }

    fn cycle<'a>(
        link: &'a ScriptedLink,
        map: &'a RegisterMap,
        local: &'a MemoryStore,
        remote: Option<&'a MemoryRemote>,
    ) -> Cycle<'a, ScriptedLink, MemoryStore, MemoryRemote> {
        Cycle {
            link,
            map,
            plan: plan(),
            local,
            remote,
            seed_pk: None,
        }
    }

    #[test]
    fn decodes_in_map_order() {
        let map = RegisterMap::new(vec![
            ("v".to_string(), RegisterMapEntry { address: 100, count: 2, scale: 3 }),
            ("w".to_string(), RegisterMapEntry { address: 110, count: 2, scale: 0 }),
            ("f".to_string(), RegisterMapEntry { address: 120, count: 1, scale: 1 }),
        ]);
        let link = ScriptedLink::answering(vec![
            Ok(vec![0, 0]),
            Ok(vec![0, 1500]),
            Ok(vec![7, 250]),
            Ok(vec![330]),
        ]);

        let values = AcquisitionPipeline::new(&link, &map, plan()).acquire().unwrap();
        assert_eq!(values, vec![1.5, 7250.0, 33.0]);
        assert_eq!(*link.requests.borrow(), [(0, 2), (100, 2), (110, 2), (120, 1)]);
        assert_eq!(link.closes.get(), 1);
    }

    #[test]
    fn unreachable_meter_is_unavailable() {
        let link = ScriptedLink {
            unreachable: true,
            ..ScriptedLink::default()
        };
        let map = sample_map();
        let result = AcquisitionPipeline::new(&link, &map, plan()).acquire();
        assert!(matches!(result, Err(CycleError::DeviceUnavailable(_))));
        assert_eq!(link.closes.get(), 0);
    }

    #[test]
    fn probe_exception_aborts_before_reading() {
        let link = ScriptedLink::answering(vec![exception(), Ok(vec![0, 1]), Ok(vec![1])]);
        let map = sample_map();
        let result = AcquisitionPipeline::new(&link, &map, plan()).acquire();
        assert!(matches!(result, Err(CycleError::DeviceError(ModbusError::Protocol { .. }))));
        assert_eq!(link.requests.borrow().len(), 1);
        assert_eq!(link.closes.get(), 1);
    }

    #[test]
    fn failed_read_discards_partial_record() {
        let link = ScriptedLink::answering(vec![Ok(vec![0, 0]), Ok(vec![0, 2301])]);
        let map = sample_map();
        let local = MemoryStore::default().with_file("2024-03-04.csv", &["PK_no,read_at,u_an,freq", "9,x,1,2"]);

        let result = cycle(&link, &map, &local, None).run(at(5, (8, 0, 0)));
        assert!(matches!(result, Err(CycleError::DeviceError(ModbusError::Io(_)))));
        assert!(!local.exists("2024-03-05.csv"));
        assert_eq!(link.closes.get(), 1);
    }

    #[test]
    fn short_payload_is_reported_with_its_field() {
        let link = ScriptedLink::answering(vec![Ok(vec![0, 0]), Ok(vec![1])]);
        let map = sample_map();
        match AcquisitionPipeline::new(&link, &map, plan()).acquire() {
            Err(CycleError::InvalidPayloadLength { field, .. }) => assert_eq!(field, "u_an"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(link.closes.get(), 1);
    }

    #[test]
    fn probe_failure_leaves_numbering_untouched() {
        let link = ScriptedLink::answering(vec![exception()]);
        let map = sample_map();
        let local = MemoryStore::default().with_file("2024-03-05.csv", &["PK_no,read_at,u_an,freq", "9,x,1,2"]);
        let remote = MemoryRemote::default();

        assert!(cycle(&link, &map, &local, Some(&remote)).run(at(5, (8, 0, 0))).is_err());
        assert_eq!(local.lines("2024-03-05.csv").len(), 2);
        assert!(remote.tables.borrow().is_empty());

        let next = ScriptedLink::answering(vec![Ok(vec![0, 0]), Ok(vec![0, 2301]), Ok(vec![5000])]);
        let report = cycle(&next, &map, &local, Some(&remote)).run(at(5, (8, 10, 0))).unwrap();
        assert_eq!(report.pk, 10);
    }

    #[test]
    fn full_cycle_writes_both_sinks() {
        let link = ScriptedLink::answering(vec![Ok(vec![0, 0]), Ok(vec![0, 2301]), Ok(vec![5000])]);
        let map = sample_map();
        let local = MemoryStore::default().with_file("2024-03-04.csv", &["PK_no,read_at,u_an,freq", "41,x,1,2"]);
        let remote = MemoryRemote::default();

        let report = cycle(&link, &map, &local, Some(&remote)).run(at(5, (0, 0, 5))).unwrap();
        assert_eq!(report.pk, 42);
        assert_eq!(report.remote_ok, Some(true));
        assert_eq!(
            local.lines("2024-03-05.csv"),
            ["PK_no,read_at,u_an,freq", "42,2024-03-05 00:00:05,230.100,50.000"]
        );
        assert_eq!(remote.tables.borrow()["2024-03-05"].len(), 2);
    }

    #[test]
    fn offline_remote_still_backs_up_locally() {
        let link = ScriptedLink::answering(vec![Ok(vec![0, 0]), Ok(vec![0, 2301]), Ok(vec![5000])]);
        let map = sample_map();
        let local = MemoryStore::default().with_file("2024-03-05.csv", &["PK_no,read_at,u_an,freq", "1,x,1,2"]);
        let remote = MemoryRemote {
            offline: true,
            ..MemoryRemote::default()
        };

        let report = cycle(&link, &map, &local, Some(&remote)).run(at(5, (8, 0, 0))).unwrap();
        assert_eq!(report.remote_ok, Some(false));
        assert_eq!(local.lines("2024-03-05.csv")[2], "2,2024-03-05 08:00:00,230.100,50.000");
    }

    #[test]
    fn empty_backup_needs_a_seed() {
        let map = sample_map();
        let local = MemoryStore::default();
        let replies = || vec![Ok(vec![0, 0]), Ok(vec![0, 2301]), Ok(vec![5000])];

        let link = ScriptedLink::answering(replies());
        let result = cycle(&link, &map, &local, None).run(at(5, (8, 0, 0)));
        assert!(matches!(result, Err(CycleError::NoPriorRecords)));
        assert!(local.files.borrow().is_empty());

        let link = ScriptedLink::answering(replies());
        let mut seeded = cycle(&link, &map, &local, None);
        seeded.seed_pk = Some(1);
        assert_eq!(seeded.run(at(5, (8, 0, 0))).unwrap().pk, 1);
    }

    #[test]
    fn seeded_first_run_creates_the_backup_directory() {
        let dir = tempfile::tempdir().unwrap();
        let local = CsvBackup::new(dir.path().join("backup"));
        let link = ScriptedLink::answering(vec![Ok(vec![0, 0]), Ok(vec![0, 2301]), Ok(vec![5000])]);
        let map = sample_map();

        let cycle = Cycle::<_, _, MemoryRemote> {
            link: &link,
            map: &map,
            plan: plan(),
            local: &local,
            remote: None,
            seed_pk: Some(1),
        };
        assert_eq!(cycle.run(at(5, (8, 0, 0))).unwrap().pk, 1);

        let text = std::fs::read_to_string(dir.path().join("backup").join("2024-03-05.csv")).unwrap();
        assert_eq!(text, "PK_no,read_at,u_an,freq\n1,2024-03-05 08:00:00,230.100,50.000\n");
    }

    #[test]
    fn unseeded_first_run_reports_no_prior_records() {
        let dir = tempfile::tempdir().unwrap();
        let local = CsvBackup::new(dir.path().join("backup"));
        let link = ScriptedLink::answering(vec![Ok(vec![0, 0]), Ok(vec![0, 2301]), Ok(vec![5000])]);
        let map = sample_map();

        let cycle = Cycle::<_, _, MemoryRemote> {
            link: &link,
            map: &map,
            plan: plan(),
            local: &local,
            remote: None,
            seed_pk: None,
        };
        assert!(matches!(cycle.run(at(5, (8, 0, 0))), Err(CycleError::NoPriorRecords)));
    }

    #[test]
    fn local_write_failure_fails_the_cycle() {
        let link = ScriptedLink::answering(vec![Ok(vec![0, 0]), Ok(vec![0, 2301]), Ok(vec![5000])]);
        let map = sample_map();
        let local = MemoryStore {
            fail_writes: true,
            ..MemoryStore::default()
        }
        .with_file("2024-03-05.csv", &["PK_no,read_at,u_an,freq", "1,x,1,2"]);

        let result = cycle(&link, &map, &local, None).run(at(5, (8, 0, 0)));
        assert!(matches!(result, Err(CycleError::LocalWriteFailure(_))));
    }
}
