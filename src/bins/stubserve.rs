use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, trace, warn};

use debugstub::controller::{run_controller, Controller, ControllerEvent};
use debugstub::debugger::ProcessDebugger;
use debugstub::errors::StubError;
use debugstub::io::{accept_connection, DebugReader, DebugWriter};
use debugstub::server::{DebugServer, SessionOutcome};
use debugstub::sys;
use debugstub::thread::Thread;
use debugstub::ThreadId;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
/// Demo target for the in-process debug stub
///
/// Runs a small multi-threaded workload and serves the GDB remote
/// protocol on a TCP port, so a real LLDB or GDB can attach to this very
/// process:
///
///   lldb -o "gdb-remote 127.0.0.1:5555"
struct Args {
    /// Address and port to wait for the debugger on
    #[arg(short, long, default_value = "127.0.0.1:5555")]
    listen: String,

    /// How many busy worker threads to run next to the main thread
    #[arg(short, long, default_value_t = 2)]
    workers: usize,
}

fn main() -> Result<(), StubError> {
    human_panic::setup_panic!();
    setup_logger();

    let args = Args::parse();
    let main_thread = Thread::current();
    let worker_threads = spawn_workers(args.workers);

    let _controller_thread = run_controller(move |controller| {
        let mut debuggee_threads = vec![main_thread];
        debuggee_threads.extend(worker_threads.iter().copied().map(Thread::new));
        if let Err(error) = serve(controller, &args.listen, &debuggee_threads, main_thread) {
            error!("debug session failed: {error}");
            std::process::exit(1);
        }
    })?;

    // The main thread is part of the debuggee: give it something to do.
    let mut value = 0xDEAD1007u64;
    for round in 0u64.. {
        value = value.rotate_left(7) ^ round;
        if round % 512 == 0 {
            trace!("workload value: {value:#x}");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

/// Accepts one debugger and runs the session until it ends
fn serve(
    controller: Controller,
    listen_address: &str,
    debuggee_threads: &[Thread],
    main_thread: Thread,
) -> Result<(), StubError> {
    controller.initialize_exception_handling_for_threads(debuggee_threads)?;

    let (reader, writer) = accept_connection(listen_address)?;
    let debugger = ProcessDebugger::new(controller.clone(), main_thread.id());
    let server = Arc::new(Mutex::new(DebugServer::new(Box::new(debugger), writer)));

    // The utility thread owns the socket read loop; stop replies for
    // caught exceptions go out from this (the controller) thread.
    let session_server = Arc::clone(&server);
    controller.run_utility_thread(move || session_loop(&session_server, reader))?;

    loop {
        match controller.wait_for_event(None)? {
            ControllerEvent::CaughtException(exception) => {
                info!(
                    "thread {} stopped: {}",
                    exception.thread,
                    exception.reason()
                );
                // Stop the world before anyone inspects registers.
                if let Err(error) = controller.suspend_threads() {
                    warn!("could not suspend all threads: {error}");
                }
                let mut server = server.lock().unwrap();
                server.debugger_mut().note_exception(exception);
                if let Err(error) = server.send_stop_reply() {
                    warn!("could not send stop reply: {error}");
                }
            }
            ControllerEvent::Interrupted => {
                // The session loop already suspended the threads and sent
                // the stop reply.
            }
        }
    }
}

/// Socket read loop of the utility thread
fn session_loop<R, W>(server: &Arc<Mutex<DebugServer<W>>>, mut reader: R)
where
    R: DebugReader,
    W: DebugWriter,
{
    loop {
        let data = match reader.read() {
            Ok(data) => data,
            Err(error) => {
                info!("debugger connection closed: {error}");
                let mut server = server.lock().unwrap();
                server.debugger_mut().detach();
                std::process::exit(0);
            }
        };
        let outcome = server.lock().unwrap().process_packets(&data);
        match outcome {
            Ok(SessionOutcome::Pending) => {}
            Ok(SessionOutcome::Resume(entries, default_action)) => {
                let mut server = server.lock().unwrap();
                if let Err(error) = server.debugger_mut().resume(&entries, default_action) {
                    warn!("could not resume threads: {error}");
                }
            }
            Ok(SessionOutcome::Exit) => {
                info!("debug session ended");
                std::process::exit(0);
            }
            Err(error) => {
                error!("session error: {error}");
                std::process::exit(1);
            }
        }
    }
}

/// Spawns the busy demo workers and reports their thread ids
fn spawn_workers(count: usize) -> Vec<ThreadId> {
    let (tx, rx) = mpsc::channel();
    for index in 0..count {
        let tx = tx.clone();
        std::thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || {
                tx.send(sys::current_thread_id()).expect("main thread waits");
                drop(tx);
                let mut value = index as u64;
                loop {
                    value = value.wrapping_mul(6364136223846793005).wrapping_add(1);
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
            .expect("could not spawn worker thread");
    }
    drop(tx);
    rx.iter().take(count).collect()
}

fn setup_logger() {
    // construct a subscriber that prints formatted traces to stdout
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .without_time()
        .finish();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber).expect("could not setup logger");
}
