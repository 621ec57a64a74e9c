//! Request dispatcher: session lifecycle and command routing.

use crate::codec::{Decoder, Encoder};
use crate::error::{Error, Result};
use crate::hash::HashId;
use crate::protocol::{Command, Request, Response};
use crate::store::CacheStorage;
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tracing::{debug, info, warn};

/// Counters for one session.
#[derive(Debug, Default)]
pub struct SessionStats {
    requests: AtomicU64,
    gets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    errors: AtomicU64,
}

impl SessionStats {
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Serves the cache protocol over a pair of byte streams.
///
/// Requests are decoded one at a time and each is answered from its own
/// thread, so responses come back in completion order. Only the response
/// writer is shared between handlers.
pub struct Server<S, W: Write> {
    store: S,
    encoder: Encoder<W>,
}

impl<S: CacheStorage, W: Write + Send> Server<S, W> {
    pub fn new(store: S, writer: W) -> Self {
        Self {
            store,
            encoder: Encoder::new(writer),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Advertise the supported commands. Must precede any request.
    pub fn send_handshake(&self) -> Result<()> {
        self.encoder.encode(&Response::handshake())
    }

    /// Send the handshake, then serve requests until the input ends.
    pub fn run<R: Read>(&self, reader: R) -> Result<SessionStats> {
        self.send_handshake()?;
        self.serve(reader)
    }

    /// Serve requests until the input ends.
    ///
    /// Returns once every dispatched request has been answered. A decode
    /// error ends the session with that error; requests already dispatched
    /// are still answered.
    pub fn serve<R: Read>(&self, reader: R) -> Result<SessionStats> {
        let mut decoder = Decoder::new(reader);
        let stats = SessionStats::default();

        let outcome = thread::scope(|scope| {
            loop {
                let request = match decoder.decode() {
                    Ok(Some(request)) => request,
                    Ok(None) => return Ok(()),
                    Err(e) => return Err(e),
                };
                SessionStats::bump(&stats.requests);

                let id = request.id;
                let stats = &stats;
                let spawned = thread::Builder::new()
                    .name(format!("request-{}", id))
                    .spawn_scoped(scope, move || self.respond(request, stats));
                if let Err(e) = spawned {
                    warn!(id, error = %e, "could not spawn request handler");
                    SessionStats::bump(&stats.errors);
                    self.write(&Response {
                        err: Some(format!("could not spawn request handler: {}", e)),
                        ..Response::for_request(id)
                    });
                }
            }
        });

        if let Err(e) = self.store.close() {
            warn!(error = %e, "failed to close store");
        }

        info!(
            requests = stats.requests(),
            gets = stats.gets(),
            hits = stats.hits(),
            misses = stats.misses(),
            puts = stats.puts(),
            errors = stats.errors(),
            "session finished"
        );

        outcome.map(|()| stats)
    }

    /// Recover the output writer once the session is over.
    pub fn into_writer(self) -> Result<W> {
        self.encoder.into_inner()
    }

    fn respond(&self, request: Request, stats: &SessionStats) {
        let response = self.handle(request, stats);
        self.write(&response);
    }

    fn write(&self, response: &Response) {
        match self.encoder.encode(response) {
            Ok(()) => {}
            // Nothing reached the stream; the request still gets its answer
            Err(e @ Error::Json { .. }) => {
                warn!(id = response.id, error = %e, "failed to serialize response");
                let fallback = Response {
                    err: Some(format!("failed to serialize response: {}", e)),
                    ..Response::for_request(response.id)
                };
                if let Err(e) = self.encoder.encode(&fallback) {
                    warn!(id = response.id, error = %e, "failed to write response");
                }
            }
            Err(e) => warn!(id = response.id, error = %e, "failed to write response"),
        }
    }

    /// Produce the single response for a request.
    fn handle(&self, request: Request, stats: &SessionStats) -> Response {
        let id = request.id;
        let command = request.command;
        debug!(id, %command, "handling request");

        let result = match command {
            Command::Get => {
                SessionStats::bump(&stats.gets);
                self.handle_get(&request)
            }
            Command::Put => {
                SessionStats::bump(&stats.puts);
                self.handle_put(request)
            }
            Command::Close => Ok(Response::for_request(id)),
            Command::Unknown => Err(Error::UnsupportedCommand),
        };

        match result {
            Ok(response) => {
                if command == Command::Get {
                    let counter = if response.miss {
                        &stats.misses
                    } else {
                        &stats.hits
                    };
                    SessionStats::bump(counter);
                }
                response
            }
            Err(e) => {
                warn!(id, %command, error = %e, "request failed");
                SessionStats::bump(&stats.errors);
                Response {
                    err: Some(e.to_string()),
                    ..Response::for_request(id)
                }
            }
        }
    }

    fn handle_get(&self, request: &Request) -> Result<Response> {
        let action_id = required(&request.action_id, "get", "ActionID")?;
        let mut response = Response::for_request(request.id);

        let Some(path) = self.store.get(&action_id.to_hex())? else {
            response.miss = true;
            return Ok(response);
        };

        match describe_blob(&mut response, path) {
            Ok(()) => Ok(response),
            // Removed between lookup and stat
            Err(Error::Io { source }) if source.kind() == io::ErrorKind::NotFound => Ok(Response {
                miss: true,
                ..Response::for_request(request.id)
            }),
            Err(e) => Err(e),
        }
    }

    fn handle_put(&self, request: Request) -> Result<Response> {
        let action_id = required(&request.action_id, "put", "ActionID")?;
        let output_id = required(&request.output_id, "put", "OutputID")?;

        let path = self.store.put(
            &action_id.to_hex(),
            &output_id.to_hex(),
            &mut request.body.as_slice(),
        )?;

        let mut response = Response::for_request(request.id);
        describe_blob(&mut response, path)?;

        if response.output_id.as_ref() != Some(output_id) {
            return Err(Error::invalid_key(format!(
                "store returned blob {:?} for output {}",
                response.disk_path, output_id
            )));
        }
        Ok(response)
    }
}

fn required<'a>(
    id: &'a Option<HashId>,
    command: &'static str,
    field: &'static str,
) -> Result<&'a HashId> {
    id.as_ref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::missing_field(command, field))
}

/// Fill in the blob fields of a response from the file at `path`.
///
/// The output id is recovered from the file name.
fn describe_blob(response: &mut Response, path: PathBuf) -> Result<()> {
    let metadata = fs::metadata(&path)?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::invalid_key(format!("no file name in {}", path.display())))?;

    let output_id = HashId::from_hex(name)?;
    let modified = metadata.modified()?;
    let disk_path = path
        .into_os_string()
        .into_string()
        .map_err(|raw| Error::NonUtf8Path { path: raw.into() })?;

    response.output_id = Some(output_id);
    response.size = metadata.len();
    response.time = Some(DateTime::<Utc>::from(modified));
    response.disk_path = Some(disk_path);
    Ok(())
}
