//! Partitioned-mesh simulation over message-passing workers.
//!
//! Each worker owns a disjoint set of tetrahedra (plus the triangles bound
//! to them) and runs the local scheduler over the processes of its
//! partition. Diffusion directions whose destination element belongs to
//! another worker are boundary processes: firing one ships a population
//! delta to the owning worker instead of writing the pool directly.
//!
//! Coordination is a synchronous round protocol. Every round: all workers
//! propose the absolute time of their next local event (infinity when
//! quiescent); the coordinator reduces to the global minimum, ties going to
//! the lowest rank; the winning worker commits and fires; a boundary firing
//! is forwarded to the destination owner, which applies the delta and
//! refreshes the propensities reading the changed pool before the round
//! ends; every other worker advances its clock to the global time. A worker
//! whose propensities were untouched keeps its proposed time for the next
//! round; one that received a delta resamples. No worker applies a local
//! event before it is confirmed as the global minimum, and clocks agree
//! across workers after every round.
//!
//! Workers communicate exclusively over `std::sync::mpsc` channels; there
//! is no shared memory between partitions. A broken channel is fatal to the
//! run.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::kproc::{BoundaryDelta, KProcId};
use crate::mesh::{MeshDesc, MeshState};
use crate::model::Model;
use crate::scheduler::{Checkpoint, RunStatus, SimState};
use crate::statedef::Statedef;
use crate::{SimError, SpecId, TetId};

enum CoordMsg {
    ProposeNext,
    Commit,
    AdvanceTo(f64),
    ApplyDelta(BoundaryDelta),
    Halt,
}

enum WorkerMsg {
    Proposal { rank: usize, time: f64 },
    Fired { boundary: Option<BoundaryDelta> },
    Applied(Result<(), String>),
}

struct Worker {
    rank: usize,
    state: SimState,
    /// Absolute time and process of the cached next-event measurement;
    /// invalidated by firing and by incoming boundary deltas.
    pending: Option<(f64, KProcId)>,
}

impl Worker {
    fn propose(&mut self) -> f64 {
        if self.pending.is_none() {
            self.pending = self.state.select_next();
        }
        self.pending.map_or(f64::INFINITY, |(t, _)| t)
    }

    fn commit(&mut self) -> Option<BoundaryDelta> {
        let (t, id) = self.pending.take().expect("commit without a proposal");
        self.state.fire_at(id, t)
    }

    fn apply_delta(&mut self, d: BoundaryDelta) -> Result<(), SimError> {
        self.state.apply_external_delta(d.dest_tet, d.spec, d.delta)?;
        // The delta moved this partition's propensities; the cached
        // measurement no longer describes them.
        self.pending = None;
        Ok(())
    }
}

fn worker_loop(mut w: Worker, rx: Receiver<CoordMsg>, tx: Sender<WorkerMsg>) -> SimState {
    while let Ok(msg) = rx.recv() {
        match msg {
            CoordMsg::ProposeNext => {
                let time = w.propose();
                if tx
                    .send(WorkerMsg::Proposal { rank: w.rank, time })
                    .is_err()
                {
                    break;
                }
            }
            CoordMsg::Commit => {
                let boundary = w.commit();
                if tx.send(WorkerMsg::Fired { boundary }).is_err() {
                    break;
                }
            }
            CoordMsg::AdvanceTo(t) => w.state.advance_clock(t),
            CoordMsg::ApplyDelta(d) => {
                let result = w.apply_delta(d).map_err(|e| e.to_string());
                if tx.send(WorkerMsg::Applied(result)).is_err() {
                    break;
                }
            }
            CoordMsg::Halt => break,
        }
    }
    w.state
}

fn proto<E: std::fmt::Display>(e: E) -> SimError {
    SimError::Protocol(e.to_string())
}

/// Full state of a partitioned run: the global clock plus one per-rank
/// scheduler checkpoint. Only taken between runs, when every worker clock
/// agrees with the global one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DistCheckpoint {
    pub time: f64,
    pub workers: Vec<Checkpoint>,
}

impl DistCheckpoint {
    pub fn to_json(&self) -> Result<String, SimError> {
        serde_json::to_string(self).map_err(|e| SimError::Checkpoint(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, SimError> {
        serde_json::from_str(json).map_err(|e| SimError::Checkpoint(e.to_string()))
    }
}

/// Distributed simulation: one local scheduler per mesh partition, driven
/// by the round protocol above. Worker states live in this struct between
/// runs, so counts can be set and read without messaging.
pub struct DistSim {
    states: Vec<SimState>,
    /// Global tet id -> (owner rank, index local to that worker).
    tet_loc: Vec<(usize, TetId)>,
    n_species: usize,
    time: f64,
}

impl DistSim {
    /// Builds one worker per partition rank. `partition[t]` is the owning
    /// rank of global tet `t`; ranks must be dense in `0..n_workers`.
    pub fn new(
        model: &Model,
        mesh: &MeshDesc,
        partition: &[usize],
        seed: Option<u64>,
    ) -> Result<Self, SimError> {
        mesh.validate(model.n_comps(), model.n_patches())?;
        if partition.len() != mesh.tets.len() {
            return Err(SimError::Shape(format!(
                "partition length {} does not match tet count {}",
                partition.len(),
                mesh.tets.len()
            )));
        }
        let n_workers = partition.iter().max().map_or(0, |&r| r + 1);
        if n_workers == 0 {
            return Err(SimError::InvalidArgument(
                "partition must assign at least one worker".into(),
            ));
        }

        let mut owned: Vec<Vec<TetId>> = vec![Vec::new(); n_workers];
        let mut tet_loc = vec![(0usize, 0usize); mesh.tets.len()];
        let mut local_of = vec![None; mesh.tets.len()];
        for (t, &rank) in partition.iter().enumerate() {
            tet_loc[t] = (rank, owned[rank].len());
            local_of[t] = Some(owned[rank].len());
            owned[rank].push(t);
        }
        if let Some(rank) = owned.iter().position(|tets| tets.is_empty()) {
            return Err(SimError::InvalidArgument(format!(
                "partition ranks must be dense, rank {rank} owns no elements"
            )));
        }

        let statedef = Statedef::new(model)?;
        let mut states = Vec::with_capacity(n_workers);
        for (rank, owned_tets) in owned.iter().enumerate() {
            let mesh_state = MeshState::build(&statedef, mesh, owned_tets, partition, &local_of)?;
            states.push(SimState::build(
                statedef.clone(),
                mesh_state,
                seed,
                rank as u64,
            ));
        }

        Ok(Self {
            states,
            tet_loc,
            n_species: model.n_species(),
            time: 0.0,
        })
    }

    pub fn n_workers(&self) -> usize {
        self.states.len()
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn n_species(&self) -> usize {
        self.n_species
    }

    /// Count of one species in a global tet, `None` when not declared
    /// there.
    pub fn get_tet_count(&self, tet: TetId, spec: SpecId) -> Option<u64> {
        let (rank, local) = *self.tet_loc.get(tet)?;
        self.states[rank].get_tet_count(local, spec)
    }

    pub fn set_tet_count(&mut self, tet: TetId, spec: SpecId, n: u64) -> Result<(), SimError> {
        let &(rank, local) = self.tet_loc.get(tet).ok_or_else(|| {
            SimError::InvalidArgument(format!("unknown tet index {tet}"))
        })?;
        self.states[rank].set_tet_count(local, spec, n)
    }

    /// Total count of one species across all partitions.
    pub fn spec_count(&self, spec: SpecId) -> u64 {
        self.states.iter().map(|s| s.spec_count(spec)).sum()
    }

    pub fn set_membrane_potential(&mut self, v: f64) {
        for s in &mut self.states {
            s.set_membrane_potential(v);
        }
    }

    pub fn checkpoint(&self) -> DistCheckpoint {
        DistCheckpoint {
            time: self.time,
            workers: self.states.iter().map(|s| s.checkpoint()).collect(),
        }
    }

    /// Restores a checkpoint taken from an identically partitioned run.
    pub fn restore(&mut self, cp: &DistCheckpoint) -> Result<(), SimError> {
        if cp.workers.len() != self.states.len() {
            return Err(SimError::Shape(format!(
                "checkpoint has {} worker states, this run has {}",
                cp.workers.len(),
                self.states.len()
            )));
        }
        for (state, wcp) in self.states.iter_mut().zip(&cp.workers) {
            state.restore(wcp)?;
        }
        self.time = cp.time;
        Ok(())
    }

    /// Advances every partition to `t_end` under the round protocol.
    /// Returns `Quiescent` when all workers ran out of events first. Any
    /// transport failure aborts the run; no partial-failure continuation
    /// exists.
    pub fn run_until(&mut self, t_end: f64) -> Result<RunStatus, SimError> {
        if t_end <= self.time {
            return Ok(RunStatus::Completed);
        }
        let states = std::mem::take(&mut self.states);
        let (status, states) = thread::scope(|scope| {
            let mut to_workers = Vec::with_capacity(states.len());
            let mut from_workers = Vec::with_capacity(states.len());
            let mut handles = Vec::with_capacity(states.len());
            for (rank, state) in states.into_iter().enumerate() {
                let (ctx, crx) = channel::<CoordMsg>();
                let (wtx, wrx) = channel::<WorkerMsg>();
                to_workers.push(ctx);
                from_workers.push(wrx);
                let worker = Worker {
                    rank,
                    state,
                    pending: None,
                };
                handles.push(scope.spawn(move || worker_loop(worker, crx, wtx)));
            }

            let status = Self::coordinate(&to_workers, &from_workers, t_end)?;

            for tx in &to_workers {
                tx.send(CoordMsg::Halt).map_err(proto)?;
            }
            let mut collected = Vec::with_capacity(handles.len());
            for h in handles {
                collected.push(h.join().map_err(|_| proto("worker thread panicked"))?);
            }
            Ok::<_, SimError>((status, collected))
        })?;
        self.states = states;
        self.time = t_end;
        Ok(status)
    }

    fn coordinate(
        to_workers: &[Sender<CoordMsg>],
        from_workers: &[Receiver<WorkerMsg>],
        t_end: f64,
    ) -> Result<RunStatus, SimError> {
        loop {
            // Propose phase: every worker measures its next local event.
            for tx in to_workers {
                tx.send(CoordMsg::ProposeNext).map_err(proto)?;
            }
            let mut min_time = f64::INFINITY;
            let mut winner = None;
            for (rank, rx) in from_workers.iter().enumerate() {
                match rx.recv().map_err(proto)? {
                    WorkerMsg::Proposal { rank: r, time } => {
                        debug_assert_eq!(r, rank);
                        // Strict comparison keeps the lowest rank on ties.
                        if time < min_time {
                            min_time = time;
                            winner = Some(rank);
                        }
                    }
                    _ => return Err(proto("expected a proposal")),
                }
            }

            let Some(winner) = winner else {
                // Every partition is quiescent.
                for tx in to_workers {
                    tx.send(CoordMsg::AdvanceTo(t_end)).map_err(proto)?;
                }
                return Ok(RunStatus::Quiescent);
            };
            if min_time > t_end {
                for tx in to_workers {
                    tx.send(CoordMsg::AdvanceTo(t_end)).map_err(proto)?;
                }
                return Ok(RunStatus::Completed);
            }

            // Commit phase: only the global minimum fires.
            tracing::debug!(winner, time = min_time, "committing global event");
            to_workers[winner].send(CoordMsg::Commit).map_err(proto)?;
            match from_workers[winner].recv().map_err(proto)? {
                WorkerMsg::Fired { boundary } => {
                    if let Some(delta) = boundary {
                        to_workers[delta.dest_rank]
                            .send(CoordMsg::ApplyDelta(delta))
                            .map_err(proto)?;
                        match from_workers[delta.dest_rank].recv().map_err(proto)? {
                            WorkerMsg::Applied(result) => result.map_err(proto)?,
                            _ => return Err(proto("expected a delta acknowledgement")),
                        }
                    }
                }
                _ => return Err(proto("expected a firing report")),
            }

            // Everyone else observes the new global time.
            for (rank, tx) in to_workers.iter().enumerate() {
                if rank != winner {
                    tx.send(CoordMsg::AdvanceTo(min_time)).map_err(proto)?;
                }
            }
        }
    }
}
