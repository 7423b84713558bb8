//! Global ordering across whole agreement sites

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use warp_agreement::{
    AgreementSite, FaultMessage, LocalMailbox, Mailbox, MeshRouter, Message, OrderedTransaction,
    SiteId, SiteSet, TransactionExecutor, TxnId,
};
use warp_config::AgreementConfig;

#[derive(Debug, Default)]
struct Recorder {
    executed: Vec<TxnId>,
    failures: Vec<BTreeMap<SiteId, TxnId>>,
}

impl TransactionExecutor for Recorder {
    fn execute(&mut self, txn: &OrderedTransaction) {
        self.executed.push(txn.txn_id());
    }

    fn sites_failed(&mut self, decision: &BTreeMap<SiteId, TxnId>) {
        self.failures.push(decision.clone());
    }
}

fn build_site(mailbox: Arc<LocalMailbox>, mesh: &[SiteId]) -> AgreementSite<Recorder> {
    let config = AgreementConfig::testing(mailbox.site_id(), mesh.iter().copied());
    AgreementSite::new(&config, mailbox, Recorder::default()).unwrap()
}

#[test]
fn test_every_site_releases_the_same_order() {
    warp_telemetry::init_test_logging();

    let mesh = [0, 1, 2];
    let router = MeshRouter::new();
    let mailboxes: Vec<_> = mesh.iter().map(|&s| router.connect(s)).collect();
    let mut sites: Vec<_> = mailboxes
        .into_iter()
        .map(|mailbox| build_site(mailbox, &mesh))
        .collect();

    let mut proposed = Vec::new();
    for round in 0..3u8 {
        for site in sites.iter_mut() {
            let payload = Bytes::from(vec![round; 4]);
            proposed.push(site.propose(payload, round == 1).unwrap());
        }
    }
    proposed.sort_unstable();

    let deadline = Instant::now() + Duration::from_secs(20);
    while sites.iter().any(|s| s.executor().executed.len() < proposed.len()) {
        assert!(Instant::now() < deadline, "ordering stalled");
        for site in sites.iter_mut() {
            site.run_once().unwrap();
        }
    }

    for site in &sites {
        assert_eq!(site.executor().executed, proposed, "site {}", site.site_id());
        assert!(site.executor().failures.is_empty());
    }
}

#[test]
fn test_joined_site_is_ordered_with_tasks() {
    warp_telemetry::init_test_logging();

    let mesh = [0, 1];
    let router = MeshRouter::new();
    let mut sites: Vec<_> = mesh
        .iter()
        .map(|&s| build_site(router.connect(s), &mesh))
        .collect();
    let _joiner = router.connect(2);

    let before = sites[1].propose(Bytes::from_static(b"before"), false).unwrap();
    let join = sites[0].request_join(2).unwrap();
    let after = sites[1].propose(Bytes::from_static(b"after"), false).unwrap();

    let deadline = Instant::now() + Duration::from_secs(20);
    while sites.iter().any(|s| !s.mesh().contains(&2)) {
        assert!(Instant::now() < deadline, "join never released");
        for site in sites.iter_mut() {
            site.run_once().unwrap();
        }
    }

    let mut first = [before, join];
    first.sort_unstable();
    for site in &sites {
        let executed = &site.executor().executed;
        assert!(executed.starts_with(&first), "site {}", site.site_id());
        assert!(!executed.contains(&after) || executed.ends_with(&[after]));
        assert_eq!(site.mesh(), &[0, 1, 2].into_iter().collect::<SiteSet>());
    }
}

#[test]
fn test_crashed_site_is_arbitrated_and_ordering_resumes() {
    warp_telemetry::init_test_logging();

    let mesh = [0, 1, 2, 3];
    let live = [0, 1, 2];
    let router = MeshRouter::new();
    let mailboxes: Vec<Arc<LocalMailbox>> = live.iter().map(|&s| router.connect(s)).collect();

    // Site 3 never came up; each detector reports it before the sites start
    for mailbox in &mailboxes {
        let site = mailbox.site_id();
        mailbox.deliver(Message::Fault(FaultMessage::local(site, 3, true)));
    }

    // Finished sites keep stepping so their peers still get heartbeats
    let finished = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = mailboxes
        .into_iter()
        .map(|mailbox| {
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                let mut site = build_site(mailbox, &mesh);
                let txn_id = site.propose(Bytes::from_static(b"op"), false).unwrap();
                let deadline = Instant::now() + Duration::from_secs(30);
                let mut done = false;
                while !done || finished.load(Ordering::SeqCst) < live.len() {
                    assert!(Instant::now() < deadline, "site {} stalled", site.site_id());
                    site.run_once().unwrap();
                    if !done && !site.mesh().contains(&3) && site.executor().executed.len() == live.len() {
                        done = true;
                        finished.fetch_add(1, Ordering::SeqCst);
                    }
                }
                (txn_id, site)
            })
        })
        .collect();

    let mut proposed = Vec::new();
    let mut sites = Vec::new();
    for handle in handles {
        let (txn_id, site) = handle.join().unwrap();
        proposed.push(txn_id);
        sites.push(site);
    }
    proposed.sort_unstable();

    for site in &sites {
        let recorder = site.executor();
        assert_eq!(recorder.executed, proposed, "site {}", site.site_id());
        assert_eq!(recorder.failures.len(), 1);
        assert_eq!(recorder.failures[0].keys().copied().collect::<Vec<_>>(), vec![3]);
        assert_eq!(site.mesh(), &live.into_iter().collect::<SiteSet>());
        assert!(!site.is_in_arbitration());
    }
    assert!(sites
        .windows(2)
        .all(|pair| pair[0].executor().failures == pair[1].executor().failures));
}
