use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use log::{error, info, warn};

use nfq_decoy::{
    config::{Args, Config},
    dispatcher::Dispatcher,
    firewall::{Firewall, FirewallRules},
    logging,
    payload::PayloadRotation,
    rawsend::{Injector, RawSender},
    srcinfo::FlowCache,
    stats::{Reporter, Stats},
    worker::Worker,
};

const WATCH_INTERVAL: Duration = Duration::from_millis(200);

fn main() {
    if let Err(e) = run() {
        error!("{e:#}");
        eprintln!("nfq_decoy: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    logging::init(logging::level(args.silent, args.verbose), args.log_file.as_deref())
        .context("cannot initialise logging")?;

    // 启动前把配置全部校验完，出错时还没动防火墙
    let cfg = Config::try_from(&args)?;
    let payloads = PayloadRotation::from_sources(&cfg.payloads)?;
    info!("{} decoy payload(s) loaded", payloads.len());

    let sender = RawSender::open(cfg.mark.mark, cfg.send_timeout).context("cannot open raw sockets")?;
    let stats = Arc::new(Stats::default());
    let injector = Arc::new(Injector::new(
        Arc::new(FlowCache::new(cfg.cache_capacity)),
        Arc::new(payloads),
        sender,
        cfg.ttl,
        cfg.repeat,
        Arc::clone(&stats),
    ));
    let dispatcher = Dispatcher::new(injector, cfg.mark);

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("cannot install signal handler")?;
    }

    let firewall = (!cfg.skip_firewall).then(|| Firewall::from_config(&cfg));
    if let Some(fw) = &firewall {
        fw.install()?;
    }

    let result = serve(&cfg, dispatcher, &running, &stats);

    if let Some(fw) = &firewall {
        fw.teardown();
    }
    result
}

// ==========================================
// 拉起 worker，主线程只做报表和守护
// ==========================================
fn serve(cfg: &Config, dispatcher: Dispatcher<RawSender>, running: &Arc<AtomicBool>, stats: &Stats) -> Result<()> {
    let (first, last) = cfg.queue_range();
    let mut handles = Vec::with_capacity(cfg.threads as usize);
    for queue_num in first..=last {
        let worker = Worker::new(queue_num, cfg.queue_len, dispatcher.clone(), Arc::clone(running));
        match worker.spawn() {
            Ok(h) => handles.push((queue_num, h)),
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                join_all(handles);
                return Err(anyhow!("cannot spawn worker for queue {queue_num}: {e}"));
            }
        }
    }
    drop(dispatcher);
    info!("running on queues {first}..={last}, ttl reach {} hops", cfg.ttl.reach_hops());

    let mut reporter = Reporter::new(cfg.stats_interval);
    while running.load(Ordering::SeqCst) {
        // 任一 worker 退出都视为致命，整体关停
        if handles.iter().any(|(_, h)| h.is_finished()) {
            warn!("a worker stopped, shutting down");
            running.store(false, Ordering::SeqCst);
            break;
        }
        reporter.tick(stats);
        thread::sleep(WATCH_INTERVAL);
    }
    info!("shutting down");

    let failures = join_all(handles);
    let total = stats.snapshot();
    info!(
        "processed {} packets, {} decoys sent, {} failed",
        total.packets, total.decoys_sent, total.decoys_failed
    );
    match failures {
        0 => Ok(()),
        n => Err(anyhow!("{n} worker(s) failed")),
    }
}

fn join_all(handles: Vec<(u16, thread::JoinHandle<Result<(), nfq_decoy::error::WorkerError>>)>) -> usize {
    let mut failures = 0;
    for (queue_num, h) in handles {
        match h.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("{e}");
                failures += 1;
            }
            Err(_) => {
                error!("queue {queue_num}: worker panicked");
                failures += 1;
            }
        }
    }
    failures
}
