//! Connection arbitration, graceful teardown and the shared-memory
//! transport path.

mod common;

use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::{fill_pattern, phys_ni, wait_kind, Region};
use ptl4::{
    AckReq, CtEvent, EventKind, LeOptions, ListKind, MatchSpec, MdOptions, NiConfig, NiFail,
    NiOptions, Position, ProcessId, PtOptions, RejectReason, ShmemJob, TargetId,
};

const ANY: MatchSpec = MatchSpec {
    match_bits: 0,
    ignore_bits: u64::MAX,
    min_free: 0,
    id: None,
};

fn target_setup(ni: &ptl4::Ni) -> (ptl4::EqHandle, u32, Region) {
    let eq = ni.eq_alloc(256).unwrap();
    let pt = ni.pt_alloc(PtOptions::empty(), Some(eq), None).unwrap();
    let tgt = Region::new(ni, 8192);
    ni.me_append(
        pt,
        tgt.sge(),
        LeOptions::OP_PUT | LeOptions::OP_GET,
        None,
        None,
        0,
        ANY,
        ListKind::Priority,
        Position::Append,
    )
    .unwrap();
    (eq, pt, tgt)
}

/// Both peers initiate at once: at most one consumer reject (reason
/// "connecting") is observed and both puts deliver.
#[test]
fn simultaneous_connect() {
    let fabric = ptl4::SoftFabric::new();
    let a = phys_ni(&fabric, 1, 1, true);
    let b = phys_ni(&fabric, 1, 2, true);

    let (_eq_a, pt_a, _tgt_a) = target_setup(&a);
    let (_eq_b, pt_b, _tgt_b) = target_setup(&b);

    let barrier = Arc::new(Barrier::new(2));
    let spawn = |ni: ptl4::Ni, peer: ProcessId, pt: u32, barrier: Arc<Barrier>| {
        std::thread::spawn(move || {
            let eq = ni.eq_alloc(16).unwrap();
            let mut src = Region::new(&ni, 64);
            fill_pattern(&mut src.mem, 1);
            let md = ni
                .md_bind(src.sge(), Some(eq), None, MdOptions::empty())
                .unwrap();
            barrier.wait();
            ni.put(
                md,
                0,
                64,
                AckReq::Ack,
                TargetId::Phys(peer),
                pt,
                0,
                0,
                0,
                0,
            )
            .unwrap();
            let ev = wait_kind(&ni, eq, EventKind::Ack);
            assert_eq!(ev.ni_fail, NiFail::Ok);
            ni
        })
    };

    let (id_a, id_b) = (a.id(), b.id());
    let ha = spawn(a, id_b, pt_b, barrier.clone());
    let hb = spawn(b, id_a, pt_a, barrier);
    let a = ha.join().unwrap();
    let b = hb.join().unwrap();

    // A crossed connect produces at most one consumer reject, and its
    // reason is the tie-break.
    let rejects = fabric.rejects();
    assert!(rejects.len() <= 1, "unexpected rejects: {:?}", rejects);
    for r in rejects {
        assert_eq!(r, RejectReason::Connecting);
    }

    a.fini().unwrap();
    b.fini().unwrap();
}

/// Puts to self are accepted through the loopback path.
#[test]
fn loopback_self_connect() {
    let fabric = ptl4::SoftFabric::new();
    let a = phys_ni(&fabric, 2, 1, true);

    let (eq_t, pt, tgt) = target_setup(&a);
    let mut src = Region::new(&a, 128);
    fill_pattern(&mut src.mem, 5);
    let eq_i = a.eq_alloc(16).unwrap();
    let md = a
        .md_bind(src.sge(), Some(eq_i), None, MdOptions::empty())
        .unwrap();
    a.put(
        md,
        0,
        128,
        AckReq::Ack,
        TargetId::Phys(a.id()),
        pt,
        0,
        0,
        0,
        0,
    )
    .unwrap();
    let ev = wait_kind(&a, eq_i, EventKind::Ack);
    assert_eq!(ev.ni_fail, NiFail::Ok);
    wait_kind(&a, eq_t, EventKind::Put);
    assert_eq!(&tgt.mem[..128], &src.mem[..]);

    a.fini().unwrap();
}

/// Graceful teardown with traffic in flight: every operation completes
/// (delivered or undeliverable), buffers all return to the pool, and
/// the peer observes exactly one disconnect header.
#[test]
fn teardown_with_in_flight_sends() {
    let fabric = ptl4::SoftFabric::new();
    let a = phys_ni(&fabric, 3, 1, true);
    let b = phys_ni(&fabric, 3, 2, true);

    let (_eq_t, pt, _tgt) = target_setup(&b);

    const N: u64 = 200;
    let ct = a.ct_alloc().unwrap();
    let mut src = Region::new(&a, 4096);
    fill_pattern(&mut src.mem, 2);
    let md = a
        .md_bind(src.sge(), None, Some(ct), MdOptions::EVENT_CT_ACK)
        .unwrap();
    for _ in 0..N {
        a.put(
            md,
            0,
            4096,
            AckReq::CtAck,
            TargetId::Phys(b.id()),
            pt,
            0,
            0,
            0,
            0,
        )
        .unwrap();
    }

    a.fini().unwrap();

    // Every operation completed one way or the other.
    let ev = a.ct_get(ct).unwrap();
    assert_eq!(ev.success + ev.failure, N);

    // No buffer leaks.
    assert_eq!(a.buf_available(), a.buf_total());

    // The peer saw exactly one disconnect notification.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while b.status().disc_recv == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(b.status().disc_recv, 1);

    b.fini().unwrap();
    assert_eq!(b.buf_available(), b.buf_total());
}

/// Logical interfaces over a shared-memory job: the fragment queue path
/// moves puts and gets between co-located ranks.
#[test]
fn shmem_put_get_between_ranks() {
    let fabric = ptl4::SoftFabric::new();
    let job = Arc::new(ShmemJob::new_anon(2, 32).unwrap());

    let id0 = ProcessId::new(7, 100);
    let id1 = ProcessId::new(7, 101);
    let n0 = ptl4::Ni::init(
        NiConfig::new(fabric.clone(), id0, NiOptions::LOGICAL).with_shmem(job.clone(), 0),
    )
    .unwrap();
    let n1 = ptl4::Ni::init(
        NiConfig::new(fabric.clone(), id1, NiOptions::LOGICAL).with_shmem(job.clone(), 1),
    )
    .unwrap();
    n0.set_map(vec![id0, id1]).unwrap();
    n1.set_map(vec![id0, id1]).unwrap();

    // Rank 1 exposes a region.
    let eq_t = n1.eq_alloc(64).unwrap();
    let pt = n1.pt_alloc(PtOptions::empty(), Some(eq_t), None).unwrap();
    let tgt = Region::new(&n1, 8192);
    n1.le_append(
        pt,
        tgt.sge(),
        LeOptions::OP_PUT | LeOptions::OP_GET,
        None,
        None,
        0,
        ListKind::Priority,
        Position::Append,
    )
    .unwrap();

    // Rank 0 writes 1 KiB and reads it back, short and bulk sizes.
    let eq_i = n0.eq_alloc(64).unwrap();
    let mut src = Region::new(&n0, 8192);
    let dst = Region::new(&n0, 8192);
    let put_md = n0
        .md_bind(src.sge(), Some(eq_i), None, MdOptions::empty())
        .unwrap();
    let get_md = n0
        .md_bind(dst.sge(), Some(eq_i), None, MdOptions::empty())
        .unwrap();

    for (round, len) in [64u64, 1024, 4096].into_iter().enumerate() {
        fill_pattern(&mut src.mem, round as u8 + 11);
        n0.put(
            put_md,
            0,
            len,
            AckReq::Ack,
            TargetId::Rank(1),
            pt,
            0,
            0,
            0,
            0,
        )
        .unwrap();
        let ev = wait_kind(&n0, eq_i, EventKind::Ack);
        assert_eq!(ev.ni_fail, NiFail::Ok);
        assert_eq!(ev.mlength, len);
        assert_eq!(&tgt.mem[..len as usize], &src.mem[..len as usize]);

        n0.get(get_md, 0, len, TargetId::Rank(1), pt, 0, 0, 0)
            .unwrap();
        let ev = wait_kind(&n0, eq_i, EventKind::Reply);
        assert_eq!(ev.mlength, len);
        assert_eq!(&dst.mem[..len as usize], &src.mem[..len as usize]);
    }

    wait_kind(&n1, eq_t, EventKind::Put);

    n0.fini().unwrap();
    n1.fini().unwrap();

    // All fragments back in their owners' pools.
    assert_eq!(job.free_count(0), 32);
    assert_eq!(job.free_count(1), 32);
}

/// An atomic sum accumulates across repeated operations on one rank.
#[test]
fn shmem_atomic_sum() {
    let fabric = ptl4::SoftFabric::new();
    let job = Arc::new(ShmemJob::new_anon(2, 16).unwrap());
    let id0 = ProcessId::new(8, 200);
    let id1 = ProcessId::new(8, 201);
    let n0 = ptl4::Ni::init(
        NiConfig::new(fabric.clone(), id0, NiOptions::LOGICAL).with_shmem(job.clone(), 0),
    )
    .unwrap();
    let n1 = ptl4::Ni::init(
        NiConfig::new(fabric.clone(), id1, NiOptions::LOGICAL).with_shmem(job.clone(), 1),
    )
    .unwrap();
    n0.set_map(vec![id0, id1]).unwrap();
    n1.set_map(vec![id0, id1]).unwrap();

    let eq_t = n1.eq_alloc(16).unwrap();
    let pt = n1.pt_alloc(PtOptions::empty(), Some(eq_t), None).unwrap();
    let acc = Region::new(&n1, 8);
    n1.le_append(
        pt,
        acc.sge(),
        LeOptions::OP_PUT,
        None,
        None,
        0,
        ListKind::Priority,
        Position::Append,
    )
    .unwrap();

    let ct = n0.ct_alloc().unwrap();
    let mut one = Region::new(&n0, 8);
    one.mem.copy_from_slice(&3u64.to_ne_bytes());
    let md = n0
        .md_bind(one.sge(), None, Some(ct), MdOptions::EVENT_CT_ACK)
        .unwrap();

    for _ in 0..10 {
        n0.atomic(
            md,
            0,
            8,
            AckReq::CtAck,
            TargetId::Rank(1),
            pt,
            0,
            0,
            0,
            0,
            ptl4::AtomOp::Sum,
            ptl4::AtomType::U64,
        )
        .unwrap();
    }
    n0.ct_wait_timeout(ct, 10, Duration::from_secs(5)).unwrap();
    assert_eq!(
        u64::from_ne_bytes(acc.mem[..8].try_into().unwrap()),
        30
    );

    n0.fini().unwrap();
    n1.fini().unwrap();
}

/// Chained triggered counters: an increment that fires a counter
/// increment that fires a put.
#[test]
fn triggered_ct_chain() {
    let fabric = ptl4::SoftFabric::new();
    let a = phys_ni(&fabric, 9, 1, true);
    let b = phys_ni(&fabric, 9, 2, true);

    let (eq_t, pt, _tgt) = target_setup(&b);

    let first = a.ct_alloc().unwrap();
    let second = a.ct_alloc().unwrap();
    let mut src = Region::new(&a, 8);
    src.mem.copy_from_slice(&42u64.to_ne_bytes());
    let md = a.md_bind(src.sge(), None, None, MdOptions::empty()).unwrap();

    // first >= 2  ->  second += 1  ->  put fires.
    a.triggered_ct_inc(second, CtEvent::new(1, 0), first, 2)
        .unwrap();
    a.triggered_put(
        md,
        0,
        8,
        AckReq::NoAck,
        TargetId::Phys(b.id()),
        pt,
        0,
        0,
        0,
        0,
        second,
        1,
    )
    .unwrap();

    a.ct_inc(first, CtEvent::new(1, 0)).unwrap();
    assert_eq!(a.ct_get(second).unwrap().success, 0);
    a.ct_inc(first, CtEvent::new(1, 0)).unwrap();
    assert_eq!(a.ct_get(second).unwrap().success, 1);

    let ev = wait_kind(&b, eq_t, EventKind::Put);
    assert_eq!(ev.mlength, 8);

    a.fini().unwrap();
    b.fini().unwrap();
}
