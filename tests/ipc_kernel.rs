mod common;

use cafe_core::addr::PhysAddr;
use cafe_core::ipc::{
    BlockState, DriverState, InterruptLine, IoctlArgs, IoctlvArgs, IosError, IpcCommand, IpcFifo,
    IpcKernelDriver, ProcessIdentity, RamPartitionId, RequestBlockFlags, SeekOrigin,
    IPCK_BUFFER_COUNT,
};
use cafe_core::Error;
use common::{open_kernel_driver, FakeIos, ReplyMode, TIMEOUT};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const APP: RamPartitionId = RamPartitionId::MainApplication;

#[test_log::test]
fn fifo_of_four() {
    let mut fifo = IpcFifo::<char, 4>::new();
    for item in ['A', 'B', 'C', 'D'] {
        fifo.push(item).unwrap();
    }
    assert_eq!(fifo.push('E'), Err(Error::QueueFull));
    assert_eq!(fifo.pop(), Ok('A'));
    fifo.push('E').unwrap();

    let drained: Vec<_> = std::iter::from_fn(|| fifo.pop().ok()).collect();
    assert_eq!(drained, ['B', 'C', 'D', 'E']);
    assert_eq!(fifo.max_count(), 4);
    assert_eq!(fifo.len(), 0);
}

#[test_log::test]
fn fifo_count_tracks_net_pushes() {
    let mut fifo = IpcFifo::<u32, 8>::new();
    let mut expected = 0usize;
    let mut peak = 0usize;
    // a fixed but irregular push/pop pattern
    for step in 0u32..200 {
        if step % 3 == 0 || step % 7 == 0 {
            if fifo.pop().is_ok() {
                expected -= 1;
            }
        } else if fifo.push(step).is_ok() {
            expected += 1;
        }
        peak = peak.max(expected);
        assert!(fifo.len() <= fifo.capacity());
        assert_eq!(fifo.len(), expected);
        assert_eq!(fifo.max_count(), peak);
    }
}

#[test_log::test]
fn driver_state_machine() {
    let ios = FakeIos::new(ReplyMode::Immediate);
    let line = Arc::new(InterruptLine::new());
    let mut driver = IpcKernelDriver::new(0, TIMEOUT, ios, line);
    assert_eq!(driver.state(), DriverState::Invalid);
    assert_eq!(driver.open_driver(), Err(Error::NotReady));
    assert_eq!(
        driver
            .allocate_request_block(APP, IpcCommand::Open, 0, None, 0)
            .unwrap_err(),
        Error::NotReady
    );

    driver.init().unwrap();
    assert_eq!(driver.state(), DriverState::Initialised);
    driver.open_driver().unwrap();
    assert_eq!(driver.state(), DriverState::Open);
    assert_eq!(driver.free_fifo().len(), IPCK_BUFFER_COUNT);
    assert_eq!(driver.open_driver(), Err(Error::NotReady));
}

#[test_log::test]
fn allocate_then_free_restores_block() {
    let ios = FakeIos::new(ReplyMode::Immediate);
    let mut driver = open_kernel_driver(0, &ios);

    let first = driver.allocate_request_block(APP, IpcCommand::Open, 0, None, 0).unwrap();
    let baseline = driver.block(first).unwrap().flags;
    assert!(baseline.allocated);
    assert_eq!(baseline.owner, Some(APP));
    assert_eq!(baseline.command, IpcCommand::Open);

    driver.free_request_block(first).unwrap();
    let block = driver.block(first).unwrap();
    assert_eq!(block.flags, RequestBlockFlags::default());
    assert!(block.callback.is_none());
    assert_eq!(driver.free_fifo().len(), IPCK_BUFFER_COUNT);

    assert_eq!(driver.free_request_block(first), Err(Error::InvalidArgument));
}

#[test_log::test]
fn exhausted_pool_reports_queue_full() {
    let ios = FakeIos::new(ReplyMode::Immediate);
    let mut driver = open_kernel_driver(0, &ios);

    let blocks: Vec<_> = (0..IPCK_BUFFER_COUNT)
        .map(|_| {
            driver
                .allocate_request_block(APP, IpcCommand::Ioctl, 3, None, 0)
                .unwrap()
        })
        .collect();

    assert_eq!(
        driver
            .allocate_request_block(APP, IpcCommand::Ioctl, 3, None, 0)
            .unwrap_err(),
        Error::QueueFull
    );
    assert_eq!(driver.stats().allocation_failures, 1);

    let freed = blocks[17];
    driver.free_request_block(freed).unwrap();
    let again = driver
        .allocate_request_block(APP, IpcCommand::Ioctl, 3, None, 0)
        .unwrap();
    assert_eq!(again, freed);
}

#[test_log::test]
fn header_is_stamped() {
    let ios = FakeIos::new(ReplyMode::Immediate);
    let mut driver = open_kernel_driver(1, &ios);
    driver.set_process_identity(
        APP,
        ProcessIdentity {
            title_id: 0x0005_0000_1010_1D00,
            group_id: 0x1D,
        },
    );

    let id = driver.allocate_request_block(APP, IpcCommand::Close, 9, None, 0).unwrap();
    let request = driver.read_request(id).unwrap();
    assert_eq!(request.request.command, IpcCommand::Close);
    assert_eq!(request.request.handle, 9);
    assert_eq!(request.request.cpu_id, 2);
    assert_eq!(request.request.client_pid, APP as u32);
    assert_eq!(request.request.title_id, 0x0005_0000_1010_1D00);
    assert_eq!(request.request.group_id, 0x1D);
    driver.free_request_block(id).unwrap();

    // the next user of the block sees what came before
    let next = loop {
        let next = driver.allocate_request_block(APP, IpcCommand::Read, 4, None, 0).unwrap();
        if next == id {
            break next;
        }
    };
    let request = driver.read_request(next).unwrap();
    assert_eq!(request.prev_command, IpcCommand::Close);
    assert_eq!(request.prev_handle, 9);
}

#[test_log::test]
fn sync_calls_complete() -> anyhow::Result<()> {
    let ios = FakeIos::new(ReplyMode::Immediate);
    let mut driver = open_kernel_driver(0, &ios);

    let handle = driver.open(APP, "/dev/fsa", 0)?;
    assert_eq!(handle, 1);
    assert_eq!(driver.read(APP, handle, PhysAddr::new(0x1000_0000), 0x40)?, 0x40);
    assert_eq!(driver.write(APP, handle, PhysAddr::new(0x1000_0000), 0x20)?, 0x20);
    assert_eq!(driver.seek(APP, handle, 0x100, SeekOrigin::Start)?, 0);
    driver.ioctl(
        APP,
        handle,
        IoctlArgs {
            request: 0x1,
            input: PhysAddr::new(0x1000_0000),
            input_len: 0x10,
            ..IoctlArgs::default()
        },
    )?;
    driver.close(APP, handle)?;

    assert_eq!(
        driver.open(APP, "/dev/missing", 0),
        Err(Error::Ios(IosError::NO_EXISTS))
    );
    assert_eq!(driver.stats().processes[APP.index()].replies, 7);
    assert_eq!(
        driver.stats().processes[APP.index()].last_error,
        Some(IosError::NO_EXISTS)
    );
    assert_eq!(driver.free_fifo().len(), IPCK_BUFFER_COUNT);
    assert_eq!(driver.outbound_fifo().max_count(), 1);
    Ok(())
}

#[test_log::test]
fn null_buffers_with_length_are_rejected() {
    let ios = FakeIos::new(ReplyMode::Immediate);
    let mut driver = open_kernel_driver(0, &ios);
    assert_eq!(
        driver.read(APP, 1, PhysAddr::NULL, 0x10),
        Err(Error::InvalidArgument)
    );
    let ioctl = IoctlArgs {
        output_len: 4,
        ..IoctlArgs::default()
    };
    assert_eq!(driver.ioctl(APP, 1, ioctl), Err(Error::InvalidArgument));
    assert_eq!(driver.free_fifo().len(), IPCK_BUFFER_COUNT);
}

#[test_log::test]
fn ioctlv_vector_counts_do_not_overflow() {
    let ios = FakeIos::new(ReplyMode::Immediate);
    let mut driver = open_kernel_driver(0, &ios);

    let wrapping = IoctlvArgs {
        num_in: u32::MAX,
        num_out: 1,
        ..IoctlvArgs::default()
    };
    assert_eq!(wrapping.validate(), Err(Error::InvalidArgument));
    assert_eq!(driver.ioctlv(APP, 1, wrapping), Err(Error::InvalidArgument));

    let with_vectors = IoctlvArgs {
        vecs: PhysAddr::new(0x1000_0000),
        ..wrapping
    };
    assert_eq!(with_vectors.validate(), Ok(()));
    assert_eq!(IoctlvArgs::default().validate(), Ok(()));
    assert_eq!(driver.free_fifo().len(), IPCK_BUFFER_COUNT);
}

#[test_log::test]
fn rejected_submission_releases_the_block() {
    let ios = FakeIos::new(ReplyMode::Reject);
    let mut driver = open_kernel_driver(0, &ios);
    let called = Arc::new(AtomicU32::new(0));

    let counter = called.clone();
    let result = driver.close_async(
        APP,
        3,
        Some(Box::new(move |_: IosError| {
            counter.fetch_add(1, Ordering::Relaxed);
        })),
    );
    assert_eq!(result.unwrap_err(), Error::Ios(IosError::NOT_READY));

    assert_eq!(driver.state(), DriverState::Open);
    assert_eq!(driver.stats().submit_failures, 1);
    assert_eq!(driver.free_fifo().len(), IPCK_BUFFER_COUNT);
    assert!(driver.outbound_fifo().is_empty());
    assert_eq!(driver.registers().ppc_ctrl, 0);
    // the dropped callback never runs
    assert_eq!(called.load(Ordering::Relaxed), 0);

    // the hardware recovers and the driver carries on
    ios.set_mode(ReplyMode::Immediate);
    driver.close(APP, 3).unwrap();
    assert_eq!(driver.stats().submit_failures, 1);
}

#[test_log::test]
fn timed_out_call_is_abandoned() {
    let ios = FakeIos::new(ReplyMode::Manual);
    let mut driver = open_kernel_driver(0, &ios);

    let start = Instant::now();
    assert_eq!(driver.open(APP, "/dev/slow", 0), Err(Error::Timeout));
    assert!(start.elapsed() >= TIMEOUT);
    assert_eq!(driver.free_fifo().len(), IPCK_BUFFER_COUNT - 1);

    let submission = ios.take_submission().unwrap();
    ios.reply(&submission, IosError(5));
    assert!(driver.handle_interrupt());

    assert_eq!(driver.free_fifo().len(), IPCK_BUFFER_COUNT);
    assert_eq!(driver.stats().invalid_reply_block, 0);
    assert!(driver.user_reply_fifo(APP).is_empty());
}

#[test_log::test]
fn async_callbacks_fire_in_reply_order() {
    let ios = FakeIos::new(ReplyMode::Manual);
    let mut driver = open_kernel_driver(2, &ios);
    let order = Arc::new(Mutex::new(Vec::new()));

    for handle in 1..=3 {
        let order = order.clone();
        driver
            .close_async(
                APP,
                handle,
                Some(Box::new(move |reply: IosError| {
                    order.lock().unwrap().push((handle, reply));
                })),
            )
            .unwrap();
    }
    assert_eq!(ios.submission_count(), 3);

    while let Some(submission) = ios.take_submission() {
        assert_eq!(submission.core, 2);
        assert_eq!(submission.request.request.cpu_id, 3);
        ios.reply(&submission, IosError::OK);
    }
    assert_eq!(driver.handle_interrupts(), 3);
    assert_eq!(
        *order.lock().unwrap(),
        [(1, IosError::OK), (2, IosError::OK), (3, IosError::OK)]
    );
}

#[test_log::test]
fn replies_without_callback_go_to_the_user_queue() {
    let ios = FakeIos::new(ReplyMode::Manual);
    let mut driver = open_kernel_driver(0, &ios);
    let notified = Arc::new(AtomicU32::new(0));
    {
        let notified = notified.clone();
        driver.register_user_notify(
            APP,
            Box::new(move |pid: RamPartitionId| {
                assert_eq!(pid, APP);
                notified.fetch_add(1, Ordering::Relaxed);
            }),
        );
    }

    let id = driver.open_async(APP, "/dev/usb", 0, None).unwrap();
    let submission = ios.take_submission().unwrap();
    assert_eq!(submission.request.name(), Some("/dev/usb"));
    assert_eq!(driver.block(id).unwrap().flags.state, BlockState::Submitted);

    ios.reply(&submission, IosError(42));
    driver.handle_interrupts();
    assert_eq!(notified.load(Ordering::Relaxed), 1);
    assert_eq!(driver.block(id).unwrap().flags.state, BlockState::Replied);
    assert_eq!(driver.free_fifo().len(), IPCK_BUFFER_COUNT - 1);

    let reply = driver.receive_user_reply(APP).unwrap();
    assert_eq!(reply.reply, IosError(42));
    assert_eq!(reply.command, IpcCommand::Open);
    assert_eq!(driver.free_fifo().len(), IPCK_BUFFER_COUNT);
    assert_eq!(driver.receive_user_reply(APP), Err(Error::QueueEmpty));
}

#[test_log::test]
fn bogus_replies_are_counted_not_processed() {
    let ios = FakeIos::new(ReplyMode::Manual);
    let mut driver = open_kernel_driver(0, &ios);
    let base = driver.memory().base();

    // outside of this core's buffers
    assert_eq!(
        driver.process_reply(PhysAddr::new(0x1000_0000), IosError::OK),
        Err(Error::InvalidAddress(0x1000_0000))
    );
    // inside, but not on a request boundary
    let misaligned = base.checked_add(0x84).unwrap();
    assert!(driver.process_reply(misaligned, IosError::OK).is_err());
    // a block nobody submitted
    assert_eq!(driver.process_reply(base, IosError::OK), Err(Error::InvalidArgument));

    assert_eq!(driver.stats().invalid_reply_address, 2);
    assert_eq!(driver.stats().invalid_reply_block, 1);
    assert_eq!(driver.free_fifo().len(), IPCK_BUFFER_COUNT);

    // a reply delivered twice only counts once
    driver.close_async(APP, 1, None).unwrap();
    let submission = ios.take_submission().unwrap();
    ios.reply(&submission, IosError::OK);
    ios.reply(&submission, IosError::OK);
    driver.handle_interrupts();
    assert_eq!(driver.stats().invalid_reply_block, 2);
    assert_eq!(driver.user_reply_fifo(APP).len(), 1);
}

#[test_log::test]
fn registers_shadow_the_last_transfer() {
    let ios = FakeIos::new(ReplyMode::Manual);
    let mut driver = open_kernel_driver(0, &ios);
    driver.close_async(APP, 1, None).unwrap();
    let submission = ios.take_submission().unwrap();

    let registers = driver.registers();
    assert_eq!(registers.ppc_msg, submission.address.get());
    assert_eq!(registers.ppc_ctrl, 0);
    assert_eq!(driver.state(), DriverState::Open);

    ios.reply(&submission, IosError::OK);
    driver.handle_interrupt();
    assert_eq!(driver.registers().arm_msg, submission.address.get());
}

#[test_log::test]
fn replies_cross_threads() {
    let ios = FakeIos::new(ReplyMode::Manual);
    let line = Arc::new(InterruptLine::new());
    ios.connect(0, line.clone());
    let mut driver = IpcKernelDriver::new(0, Duration::from_secs(10), ios.clone(), line);
    driver.init().unwrap();
    driver.open_driver().unwrap();

    let responder = {
        let ios = ios.clone();
        std::thread::spawn(move || loop {
            if let Some(submission) = ios.take_submission() {
                let reply = ios.answer(&submission.request);
                ios.reply(&submission, reply);
                break;
            }
            std::thread::yield_now();
        })
    };

    let handle = driver.open(APP, "/dev/crypto", 0).unwrap();
    assert!(handle > 0);
    responder.join().unwrap();
    assert!(driver.interrupt_line().take_reply().is_none());
}
