//! Command-line entry point for the clutch scheduler simulator.

use std::process::ExitCode;

use log::{error, info};

use clutch_sim::{logger, Engine, SimConfig};

fn main() -> ExitCode {
    let config = match SimConfig::parse_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err);
            print_usage();
            return ExitCode::from(2);
        }
    };
    logger::init(config.trace);

    info!(
        "scenario={} duration={}us cpus={} seed={}",
        config.scenario, config.duration_us, config.cpus, config.seed
    );
    let mut engine = match Engine::new(&config) {
        Ok(engine) => engine,
        Err(err) => {
            error!("failed to build simulation: {}", err);
            return ExitCode::from(2);
        }
    };
    let report = engine.run();

    if config.trace {
        for line in &report.trace {
            println!("{}", line);
        }
    }
    print_summary(&report);
    ExitCode::SUCCESS
}

fn print_summary(report: &clutch_sim::SimReport) {
    println!(
        "wakeups={} blocks={} quantum_expires={} ticks={} switches={} preemptions={}",
        report.stats.wakeups,
        report.stats.blocks,
        report.stats.quantum_expires,
        report.stats.sched_ticks,
        report.stats.context_switches,
        report.stats.preemptions,
    );
    println!(
        "warp_selections={} starvation_selections={} rt_misses={} idle_dispatches={}",
        report.stats.root_warp_selections,
        report.stats.root_starvation_selections,
        report.stats.rt_deadline_misses,
        report.stats.idle_dispatches,
    );
    for (tid, cpu) in &report.cpu_by_tid {
        println!("tid={} cpu={}us", tid, cpu);
    }
    match serde_json::to_string(&report.snapshot) {
        Ok(json) => println!("{}", json),
        Err(err) => eprintln!("snapshot serialization failed: {}", err),
    }
}

fn print_usage() {
    eprintln!(
        "usage: clutch-sim [--scenario {{mixed|warp|starvation|rt|bound|smp}}] \
         [--duration <us>] [--cpus <N>] [--seed <S>] [--trace]"
    );
}
