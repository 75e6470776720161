//! Open-time WAL reconciliation.
//!
//! On open, the two WAL files are matched against the persisted table
//! version. The file whose header carries the greater version becomes
//! current. When both files hold content (the crash fell inside a
//! compaction's rotation window) the older file is replayed first, the
//! newer one over it, and everything is compacted out to a fresh version
//! so both logs can be truncated. With a single live file, its records are
//! replayed into the memtable and appending resumes at the next page
//! boundary of the same file.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::memtable::Memtable;
use crate::wal::Wal;
use crate::zone::Zone;
use crate::errdata;

/// Replays the WAL state into `mt` and leaves `wal` ready for appending.
/// Returns the recovered memtable size accounting.
pub(crate) fn recover(
    wal: &mut Wal,
    mt: &Arc<Memtable>,
    zone: &Zone,
    config: &Config,
) -> Result<u64> {
    let mut versions = wal.read_versions();
    let zone_seq = zone.version_seq();
    tracing::info!(
        wal1 = versions[0],
        wal2 = versions[1],
        zone = zone_seq,
        "wal recovery"
    );

    // The newer file resumes as current; it may still be half full.
    if versions[0] < versions[1] {
        wal.swap_files();
        versions.swap(0, 1);
    }

    let mut mtsz = 0u64;
    if versions[0] != 0 && versions[1] != 0 {
        // Crash inside a rotation window. Replay oldest first so the newer
        // log's records win, then push everything into a fresh version and
        // clear both logs. Equal versions take the same route.
        let replayed_old = wal.replay(1, mt, &mut mtsz)?;
        let replayed_new = wal.replay(0, mt, &mut mtsz)?;
        zone.compact(mt, config.nr_workers, config.co_per_worker, 0)?;
        wal.truncate_file(1)?;
        wal.truncate_file(0)?;
        mt.clean();
        mtsz = 0;
        let seq = zone.version_seq();
        wal.seed_version(seq);
        tracing::info!(
            zone_before = zone_seq,
            zone_after = seq,
            replayed_old,
            replayed_new,
            "double-log recovery compacted"
        );
    } else {
        let rsize = wal.replay(0, mt, &mut mtsz)?;
        if rsize == 0 {
            // Nothing recoverable; start the current file fresh at the
            // zone's version.
            wal.seed_version(zone_seq);
            tracing::info!(version = zone_seq, "wal empty, starting fresh");
        } else {
            // A lone log must not be ahead of the version it was paired
            // with.
            if versions[0] > zone_seq {
                return errdata!(
                    "wal version {} ahead of table version {zone_seq}",
                    versions[0]
                );
            }
            wal.set_version(versions[0]);
            wal.set_recovered_offset(rsize)?;
            tracing::info!(version = versions[0], rsize, mtsz, "wal replayed");
        }
        wal.truncate_file(1)?;
    }

    Ok(mtsz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Wal, Arc<Memtable>, Zone, Config) {
        let config = Config::new(dir.path()).mt_size_mb(4).cache_size_mb(8);
        let zone = Zone::open(dir.path(), &config).expect("zone open");
        let wal = Wal::open(dir.path(), config.max_walsz()).expect("wal open");
        (wal, Arc::new(Memtable::new()), zone, config)
    }

    #[test]
    fn test_recover_empty_dir() {
        let dir = TempDir::new().expect("tempdir");
        let (mut wal, mt, zone, config) = setup(&dir);

        let mtsz = recover(&mut wal, &mt, &zone, &config).expect("recover");
        assert_eq!(mtsz, 0);
        assert!(mt.is_empty());
        assert_eq!(wal.version(), 1);
    }

    #[test]
    fn test_recover_single_log() {
        let dir = TempDir::new().expect("tempdir");
        {
            let (mut wal, _mt, _zone, config) = setup(&dir);
            let _ = config;
            wal.seed_version(1);
            wal.append(&Record::put(b"remix".to_vec(), b"easy".to_vec()));
            wal.append(&Record::tombstone(b"time_travel".to_vec()));
            wal.flush_sync_wait();
        }

        let (mut wal, mt, zone, config) = setup(&dir);
        let mtsz = recover(&mut wal, &mt, &zone, &config).expect("recover");
        assert!(mtsz > 0);
        assert_eq!(mt.get(b"remix").unwrap().value, b"easy");
        assert!(mt.get(b"time_travel").unwrap().tombstone);
        assert_eq!(wal.version(), 1);
        // The retired file is empty.
        assert_eq!(wal.file_size(1), 0);
    }

    #[test]
    fn test_recover_appends_after_replay() {
        let dir = TempDir::new().expect("tempdir");
        {
            let (mut wal, _mt, _zone, _config) = setup(&dir);
            wal.seed_version(1);
            wal.append(&Record::put(b"key1".to_vec(), b"value1".to_vec()));
            wal.flush_sync_wait();
        }

        let (mut wal, mt, zone, config) = setup(&dir);
        recover(&mut wal, &mt, &zone, &config).expect("recover");
        wal.append(&Record::put(b"key2".to_vec(), b"value2".to_vec()));
        wal.flush_sync_wait();

        // A second recovery sees both the old and the new record.
        let (mut wal, mt, zone, config) = setup(&dir);
        let _ = recover(&mut wal, &mt, &zone, &config).expect("recover");
        assert_eq!(mt.get(b"key1").unwrap().value, b"value1");
        assert_eq!(mt.get(b"key2").unwrap().value, b"value2");
    }

    #[test]
    fn test_recover_two_logs_compacts() {
        let dir = TempDir::new().expect("tempdir");
        {
            let (mut wal, _mt, _zone, _config) = setup(&dir);
            // Older log: version 1.
            wal.seed_version(1);
            wal.append(&Record::put(b"old".to_vec(), b"from_wal1".to_vec()));
            wal.append(&Record::put(b"both".to_vec(), b"stale".to_vec()));
            // Newer log: version 2, as a rotation would leave it.
            wal.switch(2);
            wal.append(&Record::put(b"new".to_vec(), b"from_wal2".to_vec()));
            wal.append(&Record::put(b"both".to_vec(), b"fresh".to_vec()));
            wal.flush_sync_wait();
        }

        let (mut wal, mt, zone, config) = setup(&dir);
        let mtsz = recover(&mut wal, &mt, &zone, &config).expect("recover");

        // Everything went to the zone; the memtable restarts empty.
        assert_eq!(mtsz, 0);
        assert!(mt.is_empty());
        assert_eq!(wal.file_size(0), 0);
        assert_eq!(wal.file_size(1), 0);
        assert!(zone.version_seq() >= 2);

        let v = zone.getv();
        let h = |k: &[u8]| crate::hash::key_hash32(k);
        assert_eq!(v.get(b"old", h(b"old")).unwrap().unwrap().value, b"from_wal1");
        assert_eq!(v.get(b"new", h(b"new")).unwrap().unwrap().value, b"from_wal2");
        // The newer log's record wins for the shared key.
        assert_eq!(v.get(b"both", h(b"both")).unwrap().unwrap().value, b"fresh");
    }

    #[test]
    fn test_recover_rejects_wal_ahead_of_zone() {
        let dir = TempDir::new().expect("tempdir");
        {
            let (mut wal, _mt, _zone, _config) = setup(&dir);
            wal.seed_version(9);
            wal.append(&Record::put(b"key".to_vec(), b"value".to_vec()));
            wal.flush_sync_wait();
        }

        let (mut wal, mt, zone, config) = setup(&dir);
        assert!(recover(&mut wal, &mt, &zone, &config).is_err());
    }
}
