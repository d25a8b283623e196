// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2020 Takashi Sakamoto

use {
    super::*,
    glib::{source, ControlFlow, IOCondition, MainContext, MainLoop, Source},
    nix::{errno::Errno, sys::signal, unistd},
    std::{os::unix::io::RawFd, sync::Arc, thread, time::Duration},
    tracing::{debug, error},
};

/// The thread to run event loop for sources.
pub struct Dispatcher {
    name: String,
    th: Option<thread::JoinHandle<()>>,
    ev_loop: Arc<MainLoop>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.ev_loop.quit();

        if let Some(th) = self.th.take() {
            if th.join().is_err() {
                error!("Fail to join thread for {}.", self.name);
            }
        }
    }
}

impl Dispatcher {
    const READ_CHUNK_SIZE: usize = 4096;

    pub fn run(name: String) -> Result<Dispatcher, Error> {
        // Use own context.
        let ctx = MainContext::new();
        let ev_loop = Arc::new(MainLoop::new(Some(&ctx), false));

        // launch one thread to dispatch all events.
        let l = ev_loop.clone();
        let th = thread::spawn(move || l.run());

        // TODO: better mechanism to wait for the launch.
        loop {
            thread::sleep(Duration::from_millis(10));

            if ev_loop.is_running() {
                break;
            }
        }

        debug!(name = name.as_str(), "dispatcher runs");

        let th = Some(th);
        Ok(Dispatcher { name, th, ev_loop })
    }

    pub fn stop(&mut self) {
        self.ev_loop.quit();
    }

    fn attach_src_to_ctx(&mut self, src: &Source) {
        let ctx = self.ev_loop.context();
        src.attach(Some(&ctx));
    }

    pub fn attach_signal_handler<F>(&mut self, signum: signal::Signal, cb: F)
    where
        F: FnMut() -> ControlFlow + Send + 'static,
    {
        let src =
            source::unix_signal_source_new(signum as i32, None, source::Priority::DEFAULT_IDLE, cb);

        self.attach_src_to_ctx(&src);
    }

    /// Read the file descriptor when readable. The callback receives the chunk of bytes, or
    /// empty slice at the end of file.
    pub fn attach_fd_reader<F>(&mut self, fd: RawFd, mut cb: F)
    where
        F: FnMut(&[u8]) -> ControlFlow + Send + 'static,
    {
        let cond = IOCondition::IN | IOCondition::HUP | IOCondition::ERR;
        let src = source::unix_fd_source_new(
            fd,
            cond,
            None,
            source::Priority::DEFAULT,
            move |fd, _| {
                let mut buf = [0u8; Self::READ_CHUNK_SIZE];
                match unistd::read(fd, &mut buf) {
                    Ok(0) => {
                        let _ = cb(&[]);
                        ControlFlow::Break
                    }
                    Ok(len) => cb(&buf[..len]),
                    Err(Errno::EINTR) | Err(Errno::EAGAIN) => ControlFlow::Continue,
                    Err(err) => {
                        error!(fd, "fail to read: {}", err);
                        let _ = cb(&[]);
                        ControlFlow::Break
                    }
                }
            },
        );

        self.attach_src_to_ctx(&src);
    }
}
