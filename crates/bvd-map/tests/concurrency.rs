//! Concurrent requests against one mapping, with completions arriving in
//! randomized order from independent threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, RngCore};

use bvd_core::{
    BackendKind, BvdError, BvdResult, CryptParams, Direction, IoRequest, TargetOpts, SECTOR_SIZE,
};
use bvd_map::{BackingDevice, CryptTarget, DeviceDone, MemDevice, SubRequest};

const KEY: &str = "4242424242424242424242424242424242424242424242424242424242424242";

/// Completes each sub-request on its own thread after a random delay, so
/// completion order has nothing to do with submission order.
struct ThreadedDevice {
    inner: Arc<MemDevice>,
}

impl BackingDevice for ThreadedDevice {
    fn submit(&self, sub: SubRequest, done: DeviceDone) {
        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || {
            let delay = rand::thread_rng().gen_range(0..2_000);
            std::thread::sleep(Duration::from_micros(delay));
            inner.submit(sub, done);
        });
    }
}

/// Fails the nth submitted sub-request; every other one passes through.
struct FaultDevice {
    inner: Arc<MemDevice>,
    submissions: AtomicUsize,
    fail_nth: usize,
}

impl BackingDevice for FaultDevice {
    fn submit(&self, sub: SubRequest, done: DeviceDone) {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_nth {
            done(sub, Err(BvdError::Device(format!("injected fault on sub {n}"))));
            return;
        }
        self.inner.submit(sub, done);
    }
}

fn submit_and_wait(target: &CryptTarget, req: IoRequest) -> BvdResult<()> {
    let (tx, rx) = channel();
    target.submit(req, Box::new(move |r| tx.send(r).unwrap()));
    rx.recv().expect("completion delivered")
}

fn random_sectors(n: usize) -> Vec<u8> {
    let mut data = vec![0u8; n * SECTOR_SIZE];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

#[test]
fn second_subrequest_failure_wins_over_third_success() {
    let opts = TargetOpts {
        pool_pages: 1, // one page per sub-request: 24 sectors -> 3 subs
        ..TargetOpts::default()
    };
    let device = Arc::new(FaultDevice {
        inner: MemDevice::new(64),
        submissions: AtomicUsize::new(0),
        fail_nth: 2,
    });
    let cfg = CryptParams::new("aes-cbc-plain", KEY, 0, "ram0", 0);
    let target = CryptTarget::new(&cfg, device, &opts).unwrap();

    let err = submit_and_wait(
        &target,
        IoRequest::from_vec(0, Direction::Write, random_sectors(24)),
    )
    .unwrap_err();
    assert_eq!(err, BvdError::Device("injected fault on sub 2".into()));
    assert_eq!(target.pages_in_use(), 0);
}

#[test]
fn concurrent_requests_each_complete_exactly_once() {
    let opts = TargetOpts {
        backend: BackendKind::Offloaded,
        offload_workers: 3,
        queue_depth: 8,
        pool_pages: 4,
        pool_ios: 16,
        decrypt_workers: 2,
    };
    let mem = MemDevice::new(1024);
    let device = Arc::new(ThreadedDevice {
        inner: Arc::clone(&mem),
    });
    let cfg = CryptParams::new("aes-cbc-essiv:sha256", KEY, 0, "ram0", 0);
    let target = Arc::new(CryptTarget::new(&cfg, device, &opts).unwrap());

    let fired = Arc::new(AtomicUsize::new(0));
    let threads = 8;
    let sectors_each = 16usize;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let target = Arc::clone(&target);
            let fired = Arc::clone(&fired);
            std::thread::spawn(move || {
                let base = (t * sectors_each * 2) as u64;
                let data = random_sectors(sectors_each);

                let (tx, rx) = channel();
                let fired_once = Arc::clone(&fired);
                target.submit(
                    IoRequest::from_vec(base, Direction::Write, data.clone()),
                    Box::new(move |r| {
                        fired_once.fetch_add(1, Ordering::SeqCst);
                        tx.send(r).unwrap();
                    }),
                );
                rx.recv().unwrap().unwrap();

                let req =
                    IoRequest::from_vec(base, Direction::Read, vec![0u8; data.len()]);
                let out = Arc::clone(&req.segments);
                let (tx, rx) = channel();
                let fired_once = Arc::clone(&fired);
                target.submit(
                    req,
                    Box::new(move |r| {
                        fired_once.fetch_add(1, Ordering::SeqCst);
                        tx.send(r).unwrap();
                    }),
                );
                rx.recv().unwrap().unwrap();
                assert_eq!(out[0].to_vec(), data, "thread {t}");
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(fired.load(Ordering::SeqCst), threads * 2);
    assert_eq!(target.pages_in_use(), 0, "all pages drained back");
}

#[test]
fn offloaded_reads_defer_decryption_but_still_complete() {
    let opts = TargetOpts {
        backend: BackendKind::Offloaded,
        offload_workers: 2,
        queue_depth: 4,
        ..TargetOpts::default()
    };
    let mem = MemDevice::new(64);
    let device = Arc::new(ThreadedDevice {
        inner: Arc::clone(&mem),
    });
    let cfg = CryptParams::new("aes-cbc-plain", KEY, 0, "ram0", 0);
    let target = CryptTarget::new(&cfg, device, &opts).unwrap();

    let data = random_sectors(8);
    submit_and_wait(&target, IoRequest::from_vec(4, Direction::Write, data.clone())).unwrap();

    for _ in 0..4 {
        let req = IoRequest::from_vec(4, Direction::Read, vec![0u8; data.len()]);
        let out = Arc::clone(&req.segments);
        submit_and_wait(&target, req).unwrap();
        assert_eq!(out[0].to_vec(), data);
    }
}
