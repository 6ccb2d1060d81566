//! Performance benchmarks for the hot paths of the network core

use server::dispatcher::Dispatcher;
use server::tasks::Task;
use shared::frame::{self, FrameOptions};
use shared::{adler32, xtea, InputMessage, OutputBuffer, RsaKey};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

const KEY: shared::XteaKey = [0x0123_4567, 0x89AB_CDEF, 0xFEDC_BA98, 0x7654_3210];

/// Benchmarks XTEA over a full-size frame body
#[test]
fn benchmark_xtea_round_trip() {
    let mut data = vec![0x5Au8; 8 * 1024];
    let iterations = 200;
    let start = Instant::now();

    for _ in 0..iterations {
        xtea::encrypt(&mut data, &KEY).unwrap();
        xtea::decrypt(&mut data, &KEY).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "XTEA 8 KiB round trip: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(data.iter().all(|&byte| byte == 0x5A));
    // Should complete in under 2 seconds even unoptimized
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks the frame checksum
#[test]
fn benchmark_adler32() {
    let data: Vec<u8> = (0..15_000u32).map(|i| (i % 251) as u8).collect();
    let iterations = 1_000;
    let start = Instant::now();

    let mut last = 0;
    for _ in 0..iterations {
        last = adler32(&data);
    }

    let duration = start.elapsed();
    println!(
        "Adler-32 over 15 KB: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_ne!(last, 0);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks sealing and opening an encrypted, checksummed frame
#[test]
fn benchmark_frame_seal_and_open() {
    let options = FrameOptions {
        xtea_key: Some(KEY),
        checksum: true,
    };
    let iterations = 2_000;
    let start = Instant::now();

    for i in 0..iterations {
        let mut out = OutputBuffer::new();
        out.add_u8(0x6D).unwrap();
        out.add_u32(i).unwrap();
        out.add_string("The quick brown fox").unwrap();
        frame::seal(&mut out, &options).unwrap();

        let body = bytes::BytesMut::from(&out.body()[shared::HEADER_LENGTH..]);
        let (mut msg, checksummed) = frame::open(body, Some(&KEY)).unwrap();
        assert!(checksummed);
        assert_eq!(msg.get_u8().unwrap(), 0x6D);
        assert_eq!(msg.get_u32().unwrap(), i);
    }

    let duration = start.elapsed();
    println!(
        "Frame seal+open: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks the RSA handshake decrypt a server does per login
#[test]
fn benchmark_rsa_handshake_decrypt() {
    let key = RsaKey::default();
    let mut block = [0u8; shared::RSA_BLOCK_SIZE];
    block[1..17].copy_from_slice(&[7; 16]);
    key.encrypt(&mut block).unwrap();

    let iterations = 20;
    let start = Instant::now();

    for _ in 0..iterations {
        let mut msg = InputMessage::from_slice(&block);
        msg.rsa_decrypt(&key).unwrap();
        assert_eq!(msg.get_u8().unwrap(), 7);
    }

    let duration = start.elapsed();
    println!(
        "RSA-1024 decrypt: {} iterations in {:?} ({:.2} ms/iter)",
        iterations,
        duration,
        duration.as_millis() as f64 / iterations as f64
    );

    // Unoptimized big-integer math is slow; stay generous
    assert!(duration.as_secs() < 30);
}

/// Benchmarks task throughput on the dispatcher thread
#[test]
fn benchmark_dispatcher_throughput() {
    let dispatcher = Dispatcher::new();
    dispatcher.start().unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    let tasks = 50_000;
    let start = Instant::now();

    for _ in 0..tasks {
        let counter = Arc::clone(&counter);
        assert!(dispatcher.add_task(Task::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })));
    }

    dispatcher.stop();
    dispatcher.wait_until_stopped();

    let duration = start.elapsed();
    println!(
        "Dispatcher: {} tasks in {:?} ({:.2} μs/task)",
        tasks,
        duration,
        duration.as_micros() as f64 / tasks as f64
    );

    assert_eq!(counter.load(Ordering::Relaxed), tasks);
    assert!(duration.as_secs() < 10);
}
