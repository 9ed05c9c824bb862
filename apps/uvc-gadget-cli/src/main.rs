use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, info};
use tracing_subscriber::prelude::*;
use uvc_gadget_core::configfs::ConfigReader;
use uvc_gadget_core::events::{EventLoop, Interest};
use uvc_gadget_core::sink::{V4l2Sink, VideoSink};
use uvc_gadget_core::source::TestPatternSource;
use uvc_gadget_core::stream::UvcStream;
use uvc_gadget_core::UvcGadget;

/// Reactor stop-pipe descriptor, published for the SIGINT handler.
static STOP_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_sigint(_signal: libc::c_int) {
    // Only async-signal-safe work here: a single write to the stop pipe.
    let fd = STOP_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = 1u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn install_sigint() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_sigint),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGINT, &action) }.context("install SIGINT handler")?;
    Ok(())
}

#[derive(Debug, Parser)]
#[command(name = "uvc-gadget")]
#[command(
    about = "Serve a UVC gadget function: answer host control requests and stream test frames",
    long_about = None
)]
struct Args {
    /// UVC function instance such as 'uvc.0', or gadget-qualified such as
    /// 'g1/functions/uvc.0' when several gadgets are configured.
    #[arg(value_name = "uvc-device")]
    device: String,
}

fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            std::process::exit(if err.use_stderr() { 1 } else { 0 });
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ConfigReader::default()
        .parse(&args.device)
        .context("read UVC function configuration")?;
    info!(
        device = %config.video_device.display(),
        formats = config.formats.len(),
        max_packet = config.streaming_max_packet,
        "UVC function configured"
    );

    let mut ev_loop = EventLoop::new().context("create event loop")?;
    STOP_FD.store(ev_loop.stop_handle().as_raw_fd(), Ordering::Relaxed);
    install_sigint()?;

    let sink: Rc<RefCell<dyn VideoSink>> = Rc::new(RefCell::new(
        V4l2Sink::open(&config.video_device).context("open video sink")?,
    ));
    let sink_fd = sink.borrow().fd();
    let stream = Rc::new(RefCell::new(UvcStream::new(
        Rc::clone(&sink),
        Box::new(TestPatternSource::new()),
    )));

    let mut gadget = UvcGadget::new(Rc::new(config), Rc::clone(&sink), Rc::clone(&stream));
    gadget.prepare().context("subscribe UVC events")?;

    let gadget = Rc::new(RefCell::new(gadget));
    ev_loop.watch(sink_fd, Interest::EXCEPTION, move |ev_loop| {
        gadget.borrow_mut().process_events(ev_loop);
    });

    info!("serving UVC function; press ctrl-c to stop");
    let result = ev_loop.run();

    stream.borrow_mut().shutdown();
    debug!("shutdown complete");
    result
}
