//! Automatic bdev preparation at server start

use super::config::ServerConfig;
use crate::error::{Error, Result};
use crate::storage::bdev::{BdevPreparer, HugePageInfo, PrepareRequest, MIN_HUGE_PAGE_COUNT};
use crate::storage::host::TargetUser;
use tracing::{debug, error};

/// Build the preparation request implied by `cfg`
pub fn prepare_request(cfg: &ServerConfig, user: &TargetUser, iommu_enabled: bool) -> PrepareRequest {
    let huge_page_count = if cfg.has_bdevs() {
        // nr_hugepages is per engine
        cfg.nr_hugepages * cfg.engines.len() as u64
    } else {
        MIN_HUGE_PAGE_COUNT
    };

    PrepareRequest {
        huge_page_count,
        target_user: user.name.clone(),
        pci_allowlist: cfg.bdev_include.join(" "),
        pci_blocklist: cfg.bdev_exclude.join(" "),
        disable_vfio: cfg.disable_vfio,
        disable_vmd: cfg.disable_vmd || cfg.disable_vfio || !iommu_enabled,
    }
}

/// Prepare host resources for the configured bdevs
///
/// Privilege problems are reported before anything is touched. A failed
/// preparation is only logged; the huge page check afterwards decides
/// whether the node can go on.
pub fn prep_bdev_storage<F>(
    cfg: &ServerConfig,
    preparer: &dyn BdevPreparer,
    user: &TargetUser,
    iommu_enabled: bool,
    hpi_getter: F,
) -> Result<PrepareRequest>
where
    F: FnOnce() -> Result<HugePageInfo>,
{
    let req = prepare_request(cfg, user, iommu_enabled);
    let has_bdevs = cfg.has_bdevs();

    if has_bdevs && !user.is_root() {
        if cfg.disable_vfio {
            return Err(Error::VfioDisabled);
        }
        if !iommu_enabled {
            return Err(Error::IommuDisabled);
        }
    }

    debug!("automatic NVMe prepare req: {:?}", req);
    if let Err(e) = preparer.prepare(&req) {
        error!(
            retryable = e.is_retryable(),
            "automatic NVMe prepare failed (check configuration?): {}",
            e
        );
    }

    let huge_pages = hpi_getter().map_err(|e| match e {
        Error::HugePageInfo(msg) => Error::HugePageInfo(msg),
        other => Error::HugePageInfo(other.to_string()),
    })?;

    if has_bdevs && huge_pages.free < req.huge_page_count {
        return Err(Error::InsufficientFreeHugePages {
            free: huge_pages.free,
            requested: req.huge_page_count,
        });
    }

    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::EngineConfig;
    use crate::storage::bdev::PrepareResponse;
    use crate::storage::config::{BdevClass, BdevConfig, BdevTier};
    use assert_matches::assert_matches;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingPreparer {
        calls: Mutex<Vec<PrepareRequest>>,
        fail: bool,
    }

    impl BdevPreparer for RecordingPreparer {
        fn prepare(&self, req: &PrepareRequest) -> Result<PrepareResponse> {
            self.calls.lock().push(req.clone());
            if self.fail {
                return Err(Error::Prepare("setup script exploded".into()));
            }
            Ok(PrepareResponse::default())
        }
    }

    fn config(engines: u32, with_bdevs: bool) -> ServerConfig {
        let mut cfg = ServerConfig {
            nr_hugepages: 128,
            bdev_include: vec!["0000:81:00.0".into(), "0000:82:00.0".into()],
            ..Default::default()
        };
        for idx in 0..engines {
            let mut engine = EngineConfig::new(idx);
            engine.storage.scm.mount_point = format!("/mnt/daos{}", idx).into();
            if with_bdevs {
                engine.storage.bdev = BdevTier::new(vec![
                    BdevConfig::new(BdevClass::Nvme).with_devices(["0000:81:00.0"])
                ]);
            }
            cfg.engines.push(engine);
        }
        cfg
    }

    fn free_pages(free: u64) -> impl FnOnce() -> Result<HugePageInfo> {
        move || {
            Ok(HugePageInfo {
                total: free,
                free,
                page_size_kb: 2048,
            })
        }
    }

    fn root() -> TargetUser {
        TargetUser::new("root", 0)
    }

    fn daos() -> TargetUser {
        TargetUser::new("daos", 1000)
    }

    #[test]
    fn test_request_fields() {
        let cfg = config(2, true);
        let req = prepare_request(&cfg, &daos(), true);
        assert_eq!(req.huge_page_count, 256);
        assert_eq!(req.target_user, "daos");
        assert_eq!(req.pci_allowlist, "0000:81:00.0 0000:82:00.0");
        assert_eq!(req.pci_blocklist, "");
        assert!(!req.disable_vmd);

        assert!(prepare_request(&cfg, &daos(), false).disable_vmd);

        let mut cfg = config(1, true);
        cfg.disable_vfio = true;
        let req = prepare_request(&cfg, &root(), true);
        assert!(req.disable_vfio);
        assert!(req.disable_vmd);
    }

    #[test]
    fn test_insufficient_hugepages() {
        let cfg = config(2, true);
        let preparer = RecordingPreparer::default();

        let res = prep_bdev_storage(&cfg, &preparer, &root(), true, free_pages(200));
        assert_matches!(
            res,
            Err(Error::InsufficientFreeHugePages { free: 200, requested: 256 })
        );
        assert_eq!(preparer.calls.lock().len(), 1);
    }

    #[test]
    fn test_sufficient_hugepages() {
        let cfg = config(2, true);
        let preparer = RecordingPreparer::default();
        let req = prep_bdev_storage(&cfg, &preparer, &root(), true, free_pages(256)).unwrap();
        assert_eq!(req.huge_page_count, 256);
    }

    #[test]
    fn test_non_root_vfio_disabled() {
        let mut cfg = config(1, true);
        cfg.disable_vfio = true;
        let preparer = RecordingPreparer::default();

        let res = prep_bdev_storage(&cfg, &preparer, &daos(), true, free_pages(4096));
        assert_matches!(res, Err(Error::VfioDisabled));
        assert!(preparer.calls.lock().is_empty());
    }

    #[test]
    fn test_non_root_without_iommu() {
        let cfg = config(1, true);
        let preparer = RecordingPreparer::default();

        let res = prep_bdev_storage(&cfg, &preparer, &daos(), false, free_pages(4096));
        assert_matches!(res, Err(Error::IommuDisabled));
        assert!(preparer.calls.lock().is_empty());
    }

    #[test]
    fn test_prepare_failure_is_logged_only() {
        let cfg = config(1, true);
        let preparer = RecordingPreparer {
            fail: true,
            ..Default::default()
        };

        let req = prep_bdev_storage(&cfg, &preparer, &root(), true, free_pages(4096)).unwrap();
        assert_eq!(req.huge_page_count, 128);
        assert_eq!(preparer.calls.lock().len(), 1);
    }

    #[test]
    fn test_hugepage_info_failure_is_fatal() {
        let cfg = config(1, false);
        let preparer = RecordingPreparer::default();
        let res = prep_bdev_storage(&cfg, &preparer, &daos(), false, || {
            Err(Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound)))
        });
        assert_matches!(res, Err(Error::HugePageInfo(_)));
    }

    #[test]
    fn test_no_bdevs_uses_minimum_and_skips_checks() {
        let cfg = config(2, false);
        let preparer = RecordingPreparer::default();

        // Non-root without IOMMU and too few pages is fine without bdevs.
        let req = prep_bdev_storage(&cfg, &preparer, &daos(), false, free_pages(0)).unwrap();
        assert_eq!(req.huge_page_count, MIN_HUGE_PAGE_COUNT);
        assert!(req.disable_vmd);
        assert_eq!(preparer.calls.lock().len(), 1);
    }
}
