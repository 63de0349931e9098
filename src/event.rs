use std::cell::Cell;
use std::rc::Rc;

use crate::{Connection, ConnectionState, Result};

/// A minimal reactor binding for a [`Connection`].
///
/// Each turn of the loop re-reads the connection's event mask and deadline
/// (the prepare step), sleeps in `poll` until the fd is ready or the deadline
/// passes, and then calls [`process`]. On [`quit`] the loop flushes any
/// pending outgoing messages before returning.
///
/// This is the built-in driver for programs without an event loop of their
/// own; anything with a reactor integrates directly via
/// [`Connection::as_raw_fd`], [`events`] and [`timeout`].
///
/// [`Connection`]: struct.Connection.html
/// [`process`]: struct.Connection.html#method.process
/// [`quit`]: struct.Quit.html#method.quit
/// [`Connection::as_raw_fd`]: struct.Connection.html#impl-AsRawFd
/// [`events`]: struct.Connection.html#method.events
/// [`timeout`]: struct.Connection.html#method.timeout
pub struct MainLoop {
    conn: Connection,
    quit: Rc<Cell<bool>>,
}

/// Stops a [`MainLoop`], from a dispatch callback or anywhere else on the
/// loop's thread.
///
/// [`MainLoop`]: struct.MainLoop.html
#[derive(Clone)]
pub struct Quit(Rc<Cell<bool>>);

impl Quit {
    pub fn quit(&self) {
        self.0.set(true);
    }
}

impl MainLoop {
    pub fn new(conn: &Connection) -> Self {
        MainLoop {
            conn: conn.clone(),
            quit: Rc::new(Cell::new(false)),
        }
    }

    /// A handle that makes [`run`] return.
    ///
    /// [`run`]: struct.MainLoop.html#method.run
    pub fn quitter(&self) -> Quit {
        Quit(self.quit.clone())
    }

    /// Run until [`Quit::quit`] is called or the connection fails.
    ///
    /// [`Quit::quit`]: struct.Quit.html#method.quit
    pub fn run(&self) -> Result<()> {
        while !self.quit.get() {
            // Drain everything actionable before going back to sleep.
            while self.conn.process()? {
                if self.quit.get() {
                    break;
                }
            }
            if self.quit.get() {
                break;
            }
            self.conn.wait(None)?;
        }

        if self.conn.state() != ConnectionState::Closed {
            self.conn.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MainLoop;
    use crate::{Connection, Guid};
    use ntest::timeout;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    #[timeout(15000)]
    fn run_until_quit() {
        let guid = Guid::generate();
        let (p0, p1) = UnixStream::pair().unwrap();
        let (tx, rx) = mpsc::channel();

        let peer_thread = thread::spawn(move || {
            let c = Connection::new_unix_server(p0, &guid).unwrap();
            c.emit_signal(None, "/", "org.rbus.Loop", "Wake", &()).unwrap();
            c.flush().unwrap();
            // Stay alive until the other side observed the signal.
            rx.recv().unwrap();
        });

        let c = Connection::new_unix_client(p1, false).unwrap();
        let main_loop = MainLoop::new(&c);
        let quit = main_loop.quitter();
        c.add_filter(move |_, msg| {
            assert_eq!(msg.to_string(), "Signal Wake");
            quit.quit();
            Ok(true)
        });

        main_loop.run().unwrap();

        tx.send(()).unwrap();
        peer_thread.join().unwrap();
    }
}
