// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto
mod model;

use {
    clap::Parser,
    glib::{ControlFlow, Error},
    model::*,
    nix::sys::signal,
    runtime_core::{
        cmdline::*, dispatcher::*, engine::*, stream_bus::*, LogLevel, RuntimeOperation,
    },
    std::{cell::RefCell, io::stdout, os::unix::io::AsRawFd, rc::Rc, sync::mpsc},
    tracing::{debug, debug_span, warn, Level},
};

enum Event {
    Shutdown,
    Disconnected,
    Frame(String),
}

struct UnicensParams {
    api: String,
    config_path: String,
    services: Vec<String>,
}

struct UnicensRuntime {
    engine: HalEngine<UnicensModel>,
    bus: StreamBus,
    rx: mpsc::Receiver<Event>,
    tx: mpsc::SyncSender<Event>,
    dispatchers: Vec<Dispatcher>,
}

impl Drop for UnicensRuntime {
    fn drop(&mut self) {
        // At first, stop event loop in all of dispatchers to avoid queueing new events.
        for dispatcher in &mut self.dispatchers {
            dispatcher.stop();
        }

        // Next, consume all events in queue to release blocked thread for sender.
        for _ in self.rx.try_iter() {}

        // Finally Finish I/O threads.
        self.dispatchers.clear();
    }
}

impl RuntimeOperation<UnicensParams> for UnicensRuntime {
    fn new(params: UnicensParams, log_level: Option<LogLevel>) -> Result<Self, Error> {
        if let Some(level) = log_level {
            let fmt_level = match level {
                LogLevel::Info => Level::INFO,
                LogLevel::Debug => Level::DEBUG,
            };
            // The standard output is for frames to host.
            tracing_subscriber::fmt()
                .with_max_level(fmt_level)
                .with_writer(std::io::stderr)
                .init();
        }

        let model = UnicensModel::new(&params.config_path);
        let engine = HalEngine::new(&params.api, model)?;

        let writer: SharedWriter = Rc::new(RefCell::new(stdout()));
        let bus = StreamBus::new(&params.services, writer);

        // Use uni-directional channel for communication to child threads.
        let (tx, rx) = mpsc::sync_channel(32);

        Ok(UnicensRuntime {
            engine,
            bus,
            rx,
            tx,
            dispatchers: Vec::new(),
        })
    }

    fn listen(&mut self) -> Result<(), Error> {
        self.launch_system_event_dispatcher()?;
        self.launch_host_event_dispatcher()?;

        let enter = debug_span!("init").entered();
        debug!(api = self.engine.api(), card = CARD_NAME);
        self.engine.init(&mut self.bus)?;
        enter.exit();

        Ok(())
    }

    fn run(&mut self) -> Result<(), Error> {
        let enter = debug_span!("event").entered();
        loop {
            let ev = match self.rx.recv() {
                Ok(ev) => ev,
                Err(_) => continue,
            };

            match ev {
                Event::Shutdown => break,
                Event::Disconnected => {
                    debug!("host is disconnected");
                    break;
                }
                Event::Frame(line) => {
                    let _enter = debug_span!("frame").entered();
                    self.bus.handle_frame(&mut self.engine, &line);
                }
            }
        }

        enter.exit();

        let model = self.engine.model();
        debug!(
            initialized = model.is_initialized(),
            state = ?model.state(),
            pending = self.engine.pending_count(),
            "service finishes"
        );

        Ok(())
    }
}

impl UnicensRuntime {
    const SYSTEM_DISPATCHER_NAME: &'static str = "system event dispatcher";
    const HOST_DISPATCHER_NAME: &'static str = "host event dispatcher";

    fn launch_system_event_dispatcher(&mut self) -> Result<(), Error> {
        let name = Self::SYSTEM_DISPATCHER_NAME.to_string();
        let mut dispatcher = Dispatcher::run(name)?;

        [signal::Signal::SIGINT, signal::Signal::SIGTERM]
            .iter()
            .for_each(|&signum| {
                let tx = self.tx.clone();
                dispatcher.attach_signal_handler(signum, move || {
                    let _ = tx.send(Event::Shutdown);
                    ControlFlow::Break
                });
            });

        self.dispatchers.push(dispatcher);

        Ok(())
    }

    fn launch_host_event_dispatcher(&mut self) -> Result<(), Error> {
        let name = Self::HOST_DISPATCHER_NAME.to_string();
        let mut dispatcher = Dispatcher::run(name)?;

        let tx = self.tx.clone();
        let mut lines = LineBuffer::default();
        dispatcher.attach_fd_reader(std::io::stdin().as_raw_fd(), move |bytes| {
            if bytes.is_empty() {
                if let Some(line) = lines.finish() {
                    let _ = tx.send(Event::Frame(line));
                }
                let _ = tx.send(Event::Disconnected);
                ControlFlow::Break
            } else {
                lines
                    .feed(bytes)
                    .into_iter()
                    .for_each(|res| match res {
                        Ok(line) => {
                            let _ = tx.send(Event::Frame(line));
                        }
                        Err(err) => warn!("frame is dropped: {}", err),
                    });
                ControlFlow::Continue
            }
        });

        self.dispatchers.push(dispatcher);

        Ok(())
    }
}

struct UnicensServiceCmd;

#[derive(Parser, Default)]
#[clap(name = "snd-most-unicens-hal-service")]
struct Arguments {
    /// The prefix of API, unique for each sound card.
    #[clap(long, default_value = "hal-most-unicens")]
    api: String,

    /// The directory to search configuration of UNICENS.
    #[clap(long, default_value = DEFAULT_CONFIG_PATH)]
    config_path: String,

    /// The service reachable via the host process.
    #[clap(long = "service", default_values = [ALSACORE_API, UNICENS_API])]
    services: Vec<String>,

    /// The level to debug runtime, disabled as a default.
    #[clap(long, short, value_enum)]
    log_level: Option<LogLevel>,
}

impl ServiceCmd<Arguments, UnicensParams, UnicensRuntime> for UnicensServiceCmd {
    fn params(args: &Arguments) -> (UnicensParams, Option<LogLevel>) {
        let params = UnicensParams {
            api: args.api.clone(),
            config_path: args.config_path.clone(),
            services: args.services.clone(),
        };
        (params, args.log_level)
    }
}

fn main() {
    UnicensServiceCmd::run()
}
