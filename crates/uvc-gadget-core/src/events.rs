//! Single-threaded, level-triggered event reactor.
//!
//! Watches are keyed by `(fd, interest)`: the UVC device node is watched for
//! exceptional readiness (class events) and, while streaming, independently
//! for readable (buffer completions). Callbacks run sequentially and receive
//! the reactor, so a callback may add or remove any watch, including its own.

use anyhow::{Context, Result};
use bitflags::bitflags;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe2;
use std::cell::RefCell;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::rc::Rc;
use tracing::trace;

bitflags! {
    /// Readiness conditions a watch subscribes to.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const EXCEPTION = 1 << 2;
    }
}

fn poll_flags(interest: Interest) -> PollFlags {
    let mut flags = PollFlags::empty();
    if interest.contains(Interest::READABLE) {
        flags |= PollFlags::POLLIN;
    }
    if interest.contains(Interest::WRITABLE) {
        flags |= PollFlags::POLLOUT;
    }
    if interest.contains(Interest::EXCEPTION) {
        flags |= PollFlags::POLLPRI;
    }
    flags
}

type Callback = Rc<RefCell<dyn FnMut(&mut EventLoop)>>;

struct Watch {
    fd: RawFd,
    interest: Interest,
    callback: Callback,
}

/// Wakes the reactor from another thread or a signal handler.
///
/// Stopping is a single `write(2)` of one byte, which is async-signal-safe.
/// The handle borrows the reactor's pipe; it must not be used after the
/// reactor is dropped.
#[derive(Clone, Copy, Debug)]
pub struct StopHandle {
    fd: RawFd,
}

impl StopHandle {
    pub fn stop(&self) {
        let byte = 1u8;
        unsafe {
            libc::write(self.fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

pub struct EventLoop {
    watches: Vec<Watch>,
    stopped: bool,
    wake_rx: OwnedFd,
    wake_tx: OwnedFd,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let (wake_rx, wake_tx) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).context("create reactor wake pipe")?;
        Ok(Self {
            watches: Vec::new(),
            stopped: false,
            wake_rx,
            wake_tx,
        })
    }

    /// Register `callback` for `interest` on `fd`, replacing any previous
    /// watch with the same key.
    pub fn watch(
        &mut self,
        fd: RawFd,
        interest: Interest,
        callback: impl FnMut(&mut EventLoop) + 'static,
    ) {
        self.unwatch(fd, interest);
        self.watches.push(Watch {
            fd,
            interest,
            callback: Rc::new(RefCell::new(callback)),
        });
    }

    pub fn unwatch(&mut self, fd: RawFd, interest: Interest) {
        self.watches
            .retain(|watch| watch.fd != fd || watch.interest != interest);
    }

    /// Request loop exit after the current dispatch round.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            fd: self.wake_tx.as_raw_fd(),
        }
    }

    /// Block dispatching readiness events until [`stop`](Self::stop) is
    /// called or a byte arrives on the wake pipe. Interrupted waits resume;
    /// any other wait failure is fatal.
    pub fn run(&mut self) -> Result<()> {
        while !self.stopped {
            let mut pollfds = Vec::with_capacity(self.watches.len() + 1);
            pollfds.push(PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN));
            for watch in &self.watches {
                let fd = unsafe { BorrowedFd::borrow_raw(watch.fd) };
                pollfds.push(PollFd::new(fd, poll_flags(watch.interest)));
            }

            match poll(&mut pollfds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("wait for readiness"),
            }

            let woken = pollfds[0]
                .revents()
                .unwrap_or(PollFlags::empty())
                .contains(PollFlags::POLLIN);
            // Snapshot readiness before callbacks mutate the watch list.
            let ready: Vec<(RawFd, Interest)> = self
                .watches
                .iter()
                .zip(&pollfds[1..])
                .filter_map(|(watch, pollfd)| {
                    let revents = pollfd.revents().unwrap_or(PollFlags::empty());
                    let wanted =
                        poll_flags(watch.interest) | PollFlags::POLLERR | PollFlags::POLLHUP;
                    (revents & wanted != PollFlags::empty()).then_some((watch.fd, watch.interest))
                })
                .collect();
            drop(pollfds);

            if woken {
                self.drain_wake();
                trace!("reactor woken through stop pipe");
                self.stopped = true;
                break;
            }

            for (fd, interest) in ready {
                if self.stopped {
                    break;
                }
                // Re-resolve: an earlier callback may have removed or
                // replaced this watch.
                let Some(callback) = self
                    .watches
                    .iter()
                    .find(|watch| watch.fd == fd && watch.interest == interest)
                    .map(|watch| Rc::clone(&watch.callback))
                else {
                    continue;
                };
                (&mut *callback.borrow_mut())(self);
            }
        }
        Ok(())
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 16];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_rx.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}
