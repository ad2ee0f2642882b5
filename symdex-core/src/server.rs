//! Worker-side request loop

use crate::indexer::Indexer;
use crate::protocol::{read_message, write_message, Operation, Request, Response};
use crate::SymdexError;
use serde_json::{json, Value};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    WaitingForRequest,
    Dispatching,
    WritingResult,
    Closed,
}

/// Serves one request at a time from `reader`, answering each on `writer`
/// in order, until the reader reaches end of stream.
pub struct Server<R, W> {
    reader: R,
    writer: W,
    indexer: Indexer,
    state: ServerState,
}

impl<R: BufRead, W: Write> Server<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            indexer: Indexer::new(),
            state: ServerState::WaitingForRequest,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Run until clean end of input. Returns the number of requests answered.
    ///
    /// Operation failures and undecodable request lines are answered with an
    /// error response and the loop continues; only a failure to read or
    /// write the stream itself ends it with an error.
    pub fn run(&mut self) -> crate::Result<u64> {
        let mut served = 0;
        loop {
            self.state = ServerState::WaitingForRequest;
            let response = match read_message::<_, Request>(&mut self.reader) {
                Ok(Some(request)) => {
                    self.state = ServerState::Dispatching;
                    match dispatch(&mut self.indexer, &request) {
                        Ok(value) => Response::ok(value),
                        Err(err) => {
                            debug!(op = %request.op, kind = err.kind(), "operation failed: {}", err);
                            Response::err(&err)
                        }
                    }
                }
                Ok(None) => break,
                Err(err @ SymdexError::ProtocolCorruption(_)) => {
                    warn!("rejected request: {}", err);
                    Response::err(&err)
                }
                Err(err) => {
                    self.state = ServerState::Closed;
                    return Err(err);
                }
            };

            self.state = ServerState::WritingResult;
            if let Err(err) = write_message(&mut self.writer, &response) {
                self.state = ServerState::Closed;
                return Err(err);
            }
            served += 1;
        }

        self.state = ServerState::Closed;
        info!(served, "input closed, shutting down");
        Ok(served)
    }
}

/// Decode the arguments of `request` and run it against `indexer`
pub fn dispatch(indexer: &mut Indexer, request: &Request) -> crate::Result<Value> {
    let op = request.operation()?;
    match op {
        Operation::SetDatabases => {
            let paths: Vec<PathBuf> = request.get(op, "paths")?;
            indexer.set_databases(&paths)?;
            Ok(Value::Null)
        }
        Operation::BeginFileProcessing => {
            indexer.begin_file_processing(request.get(op, "dbi")?)?;
            Ok(Value::Null)
        }
        Operation::EndFileProcessing => {
            let prune = request.get_opt(op, "prune")?.unwrap_or(true);
            let removed = indexer.end_file_processing(request.get(op, "dbi")?, prune)?;
            Ok(json!(removed))
        }
        Operation::ProcessFile => {
            let path: PathBuf = request.get(op, "path")?;
            let force = request.get_opt(op, "force")?.unwrap_or(false);
            let changed = indexer.process_file(request.get(op, "dbi")?, &path, force)?;
            Ok(json!(changed))
        }
        Operation::QueryOccurrences => {
            let symbol: String = request.get(op, "symbol")?;
            Ok(serde_json::to_value(indexer.query_occurrences(&symbol)?)?)
        }
        Operation::QueryMembers => {
            let package: String = request.get(op, "package")?;
            let prefix: String = request.get(op, "prefix")?;
            Ok(json!(indexer.query_members(&package, &prefix)?))
        }
        Operation::QueryPackages => {
            let prefix: String = request.get(op, "prefix")?;
            Ok(json!(indexer.query_packages(&prefix)?))
        }
        Operation::Commit => {
            indexer.commit()?;
            Ok(Value::Null)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode, Outcome};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn input(requests: &[Request]) -> Vec<u8> {
        let mut buf = Vec::new();
        for request in requests {
            buf.extend_from_slice(encode(request).unwrap().as_bytes());
            buf.push(b'\n');
        }
        buf
    }

    fn serve(input: Vec<u8>) -> Vec<Response> {
        let mut output = Vec::new();
        let mut server = Server::new(Cursor::new(input), &mut output);
        server.run().unwrap();
        assert_eq!(server.state(), ServerState::Closed);
        drop(server);

        let mut reader = Cursor::new(output);
        let mut responses = Vec::new();
        while let Some(response) = read_message(&mut reader).unwrap() {
            responses.push(response);
        }
        responses
    }

    fn ok(response: &Response) -> &Value {
        match &response.result {
            Outcome::Ok(value) => value,
            Outcome::Err(e) => panic!("unexpected error: {e:?}"),
        }
    }

    fn err_kind(response: &Response) -> &str {
        match &response.result {
            Outcome::Err(e) => e.kind.as_str(),
            Outcome::Ok(v) => panic!("unexpected success: {v}"),
        }
    }

    #[test]
    fn test_full_session() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("index.db");
        let file = dir.path().join("tool.py");
        std::fs::write(&file, "def run():\n    pass\n").unwrap();

        let responses = serve(input(&[
            Request::new(Operation::SetDatabases, vec![json!([db])]),
            Request::new(Operation::BeginFileProcessing, vec![json!(0)]),
            Request::new(Operation::ProcessFile, vec![json!(0), json!(file)]),
            Request::new(Operation::ProcessFile, vec![json!(0), json!(file)]),
            Request::new(Operation::EndFileProcessing, vec![json!(0)]),
            Request::new(Operation::Commit, vec![]),
            Request::new(Operation::QueryOccurrences, vec![json!("run")]),
            Request::new(Operation::QueryPackages, vec![]).with_kwarg("prefix", json!("to")),
        ]));

        assert_eq!(responses.len(), 8);
        assert_eq!(ok(&responses[0]), &Value::Null);
        assert_eq!(ok(&responses[2]), &json!(true));
        assert_eq!(ok(&responses[3]), &json!(false));
        assert_eq!(ok(&responses[4]), &json!(0));
        let found = ok(&responses[6]).as_array().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["package"], json!("tool"));
        assert_eq!(found[0]["dbi"], json!(0));
        assert_eq!(ok(&responses[7]), &json!(["tool"]));
    }

    #[test]
    fn test_errors_do_not_stop_the_loop() {
        let mut unknown = Request::new(Operation::Commit, vec![]);
        unknown.op = "format_disk".to_string();

        let mut bytes = input(&[
            Request::new(Operation::QueryPackages, vec![json!("")]),
            unknown,
        ]);
        bytes.extend_from_slice(b"{this is not json}\n");
        bytes.extend_from_slice(&input(&[Request::new(Operation::Commit, vec![json!(1)])]));

        let responses = serve(bytes);
        assert_eq!(responses.len(), 4);
        assert_eq!(err_kind(&responses[0]), "not_attached");
        assert_eq!(err_kind(&responses[1]), "unknown_operation");
        assert_eq!(err_kind(&responses[2]), "protocol_corruption");
        assert_eq!(err_kind(&responses[3]), "invalid_arguments");
    }

    #[test]
    fn test_store_open_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("missing").join("dir").join("index.db");
        let responses = serve(input(&[Request::new(
            Operation::SetDatabases,
            vec![json!([bad])],
        )]));
        assert_eq!(err_kind(&responses[0]), "store_open");
        match responses[0].clone().into_result() {
            Err(SymdexError::StoreOpen { path, .. }) => assert_eq!(path, bad),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_failure_is_file_local() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("bad.py");
        let good = dir.path().join("good.py");
        std::fs::write(&bad, "def (:\n").unwrap();
        std::fs::write(&good, "x = 1\n").unwrap();

        let responses = serve(input(&[
            Request::new(Operation::SetDatabases, vec![json!([dir.path().join("i.db")])]),
            Request::new(Operation::ProcessFile, vec![json!(0), json!(bad)]),
            Request::new(Operation::ProcessFile, vec![json!(0), json!(good)]),
        ]));
        assert_eq!(err_kind(&responses[1]), "parse_failure");
        assert!(responses[1].clone().into_result().unwrap_err().is_file_local());
        assert_eq!(ok(&responses[2]), &json!(true));
    }

    #[test]
    fn test_empty_input() {
        assert!(serve(Vec::new()).is_empty());
    }

    #[test]
    fn test_truncated_final_request_is_answered() {
        let mut bytes = input(&[Request::new(Operation::QueryPackages, vec![json!("")])]);
        bytes.extend_from_slice(br#"{"v":1,"op":"com"#);
        let responses = serve(bytes);
        assert_eq!(responses.len(), 2);
        assert_eq!(err_kind(&responses[1]), "protocol_corruption");
    }
}
