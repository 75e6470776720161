//! The compaction pipeline.
//!
//! A single background worker watches the memtable/WAL-full predicate and
//! drives each compaction through a fixed sequence whose order carries the
//! durability argument:
//!
//! 1. under the engine lock: rotate the view (the WMT becomes the IMT),
//!    switch the WAL to the other file at the next version, zero the
//!    memtable size;
//! 2. wait for readers to quiesce past the rotation;
//! 3. pin the outgoing table version;
//! 4. merge the IMT into a new version, partitions accepting or rejecting;
//! 5. walk the rejected anchor ranges and reinsert those IMT records into
//!    the new WMT, appending each to the new WAL;
//! 6. flush the new WAL and enqueue its fsync;
//! 7. rotate the view back to a single memtable;
//! 8. wait for quiescence again and clean the former IMT for reuse;
//! 9. wait for the new WAL fsync;
//! 10. truncate the retired WAL.
//!
//! A rejected key is therefore always recoverable: by the time the old log
//! disappears (step 10), the key is durable in the new log (6+9) while the
//! accepted ranges are durable in the published version (4).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::WorkerCores;
use crate::error::Result;
use crate::memtable::{Memtable, MergeDecision};
use crate::store::Engine;
use crate::zone::version::Version;

/// Background worker entry point. Exits when the engine stops running;
/// a compaction in flight is drained first.
pub(crate) fn worker_loop(engine: Arc<Engine>) {
    pin_worker(&engine.worker_cores);

    while engine.running.load(Ordering::Acquire) {
        let idle_since = Instant::now();
        while engine.running.load(Ordering::Acquire) && !engine.mt_wal_full() {
            std::thread::sleep(Duration::from_millis(10));
        }
        if !engine.running.load(Ordering::Acquire) {
            break;
        }

        tracing::debug!(
            waited_ms = idle_since.elapsed().as_millis() as u64,
            "compaction triggered"
        );
        if let Err(err) = run(&engine) {
            // Partial progress between the rotations would leave rejected
            // keys unrecoverable; stopping here is the only safe answer.
            tracing::error!(error = %err, "fatal compaction failure");
            std::process::abort();
        }
    }
}

/// One full compaction cycle.
pub(crate) fn run(engine: &Engine) -> Result<()> {
    let t0 = Instant::now();

    let (gen_comp, walsz0, mtsz0);
    {
        let mut shared = engine.shared.lock()?;
        gen_comp = engine.views.advance();
        walsz0 = shared.wal.switch(engine.zone.version_seq() + 1);
        mtsz0 = shared.mtsz;
        shared.mtsz = 0;
    }

    // From here the IMT is read-only: every reader has crossed into the
    // compacting view and writers target the new WMT.
    engine.qsbr.wait(gen_comp);
    let t_prep = Instant::now();

    let view = engine.views.view_at(gen_comp);
    let wmt = Arc::clone(&view.wmt);
    let imt = Arc::clone(
        view.imt
            .as_ref()
            .expect("compacting view carries an immutable memtable"),
    );

    // The outgoing version must outlive the reinsert walk: its anchors
    // name the rejected ranges, and its tables still serve reads for them.
    let oldv = engine.zone.getv();
    engine.zone.compact(
        &imt,
        engine.nr_workers,
        engine.co_per_worker,
        engine.max_rejsz,
    )?;
    let t_comp = Instant::now();

    reinsert_rejected(engine, &wmt, &imt, &oldv);
    let t_reinsert = Instant::now();

    {
        let mut shared = engine.shared.lock()?;
        shared.wal.flush_sync();
    }
    drop(oldv);

    let gen_normal = {
        let _shared = engine.shared.lock()?;
        engine.views.advance()
    };
    engine.qsbr.wait(gen_normal);
    let t_wait2 = Instant::now();

    // Safe now: no reader can still hold the compacting view.
    imt.clean();
    let t_clean = Instant::now();

    let (write_user, write_nbytes);
    {
        let shared = engine.shared.lock()?;
        shared.wal.io_complete();
        shared.wal.truncate_old()?;
        write_user = shared.wal.write_user;
        write_nbytes = shared.wal.write_nbytes;
    }

    let sst_write = engine.zone.stat_writes();
    let sst_read = engine.zone.stat_reads();
    let denom = write_user.max(1) as f64;
    tracing::info!(
        mtsz0,
        walsz0,
        write_user,
        write_nbytes,
        sst_write,
        write_amp = (write_nbytes + sst_write) as f64 / denom,
        read_amp = sst_read as f64 / denom,
        total_ms = t0.elapsed().as_millis() as u64,
        prep_ms = (t_prep - t0).as_millis() as u64,
        comp_ms = (t_comp - t_prep).as_millis() as u64,
        reinsert_ms = (t_reinsert - t_comp).as_millis() as u64,
        wait2_ms = (t_wait2 - t_reinsert).as_millis() as u64,
        clean_ms = (t_clean - t_wait2).as_millis() as u64,
        "compaction finished"
    );
    Ok(())
}

/// Routes every IMT record in a rejected anchor range back into the WMT.
/// A key already present in the WMT is newer and stays; everything else is
/// appended to the new WAL and inserted, exactly like a fresh write.
fn reinsert_rejected(engine: &Engine, wmt: &Arc<Memtable>, imt: &Arc<Memtable>, oldv: &Arc<Version>) {
    let anchors = oldv.anchors();
    let mut iter = imt.iter();
    let mut reinserted = 0u64;

    for (i, anchor) in anchors.iter().enumerate() {
        if !anchor.rejected {
            continue;
        }
        let end = anchors.get(i + 1).map(|next| next.key.as_slice());

        iter.seek(&anchor.key);
        loop {
            let Some(record) = iter.peek() else { break };
            if end.is_some_and(|e| record.key.as_slice() >= e) {
                break;
            }

            let key = record.key.clone();
            let mut pending = Some(record.clone());
            let committed = wmt.merge(&key, |current| {
                if current.is_some() {
                    // The WMT value is newer than anything in the IMT.
                    return MergeDecision::Keep;
                }
                let record = pending.take().expect("record pending");
                let mut shared = engine.shared.lock().unwrap();
                shared.mtsz += record.footprint() as u64;
                shared.wal.append(&record);
                drop(shared);
                MergeDecision::Insert(record)
            });
            if !committed {
                tracing::error!("reinsert merge aborted; rejected keys would be lost");
                std::process::abort();
            }

            reinserted += 1;
            iter.advance();
        }
    }

    if reinserted > 0 {
        tracing::info!(reinserted, "rejected keys rerouted to the new memtable");
    }
}

#[cfg(target_os = "linux")]
fn pin_worker(cores: &WorkerCores) {
    match cores {
        WorkerCores::List(cpus) => unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for &cpu in cpus {
                libc::CPU_SET(cpu as usize, &mut set);
            }
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                tracing::warn!(?cpus, "failed to pin compaction worker");
            } else {
                tracing::info!(?cpus, "compaction worker pinned");
            }
        },
        WorkerCores::Auto => tracing::debug!("compaction worker affinity inherited"),
        WorkerCores::Dont => tracing::debug!("compaction worker unpinned"),
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_worker(_cores: &WorkerCores) {}
