//! Test-only builders and scripted doubles for the I/O seams.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};

use crate::branch::BranchRemote;
use crate::core::session_id;
use crate::core::types::{
    CheckResult, CheckStatus, Comment, Commit, Mergeable, PrSnapshot, PrSummary,
};
use crate::io::git::Git;
use crate::io::github::PullRequests;
use crate::io::mirror::StateMirror;
use crate::io::session_client::{
    Activity, CreateSessionRequest, Session, SessionApi, SessionError, SessionState,
};

pub fn ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid rfc3339 timestamp")
        .with_timezone(&Utc)
}

/// Healthy PR `number` linked to session `s-<number>`, with no checks,
/// reviews, comments, or commits.
pub fn snapshot(number: u64) -> PrSnapshot {
    PrSnapshot {
        number,
        title: format!("PR {number}"),
        body: String::new(),
        url: format!("https://github.com/octo/widgets/pull/{number}"),
        head_branch: format!("agent-change-{number}"),
        base_branch: "jules".to_string(),
        is_draft: false,
        mergeable: Mergeable::Mergeable,
        checks: Vec::new(),
        reviews: Vec::new(),
        comments: Vec::new(),
        commits: Vec::new(),
        changed_files: Vec::new(),
        session_id: Some(format!("s-{number}")),
    }
}

pub fn failing_check(name: &str) -> CheckResult {
    CheckResult {
        name: name.to_string(),
        status: CheckStatus::Failure,
        link: None,
    }
}

pub fn comment_at(author: &str, body: &str, at: &str) -> Comment {
    Comment {
        author: author.to_string(),
        body: body.to_string(),
        created_at: Some(ts(at)),
    }
}

pub fn commit_at(sha: &str, at: &str) -> Commit {
    Commit {
        sha: sha.to_string(),
        committed_at: Some(ts(at)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    /// Starting branch of the requested session.
    Create(String),
    Get(String),
    Send(String, String),
    Approve(String),
    Activities(String),
}

/// In-memory [`SessionApi`]. Sessions are alive (`IN_PROGRESS`) unless told
/// otherwise; created sessions are numbered `created-1`, `created-2`, ...
#[derive(Debug, Default)]
pub struct ScriptedSessions {
    pub fail_send: Cell<bool>,
    pub fail_create: Cell<bool>,
    states: RefCell<HashMap<String, SessionState>>,
    forgotten: RefCell<HashSet<String>>,
    calls: RefCell<Vec<SessionCall>>,
    created: RefCell<Vec<CreateSessionRequest>>,
}

impl ScriptedSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, id: &str, state: SessionState) {
        self.states.borrow_mut().insert(id.to_string(), state);
    }

    /// Make lookups of `id` fail as if the server no longer knew it.
    pub fn forget(&self, id: &str) {
        self.forgotten.borrow_mut().insert(id.to_string());
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.borrow().clone()
    }

    pub fn created(&self) -> Vec<CreateSessionRequest> {
        self.created.borrow().clone()
    }

    fn session(&self, id: &str) -> Session {
        let state = self
            .states
            .borrow()
            .get(id)
            .copied()
            .unwrap_or(SessionState::InProgress);
        Session {
            name: format!("sessions/{id}"),
            id: Some(id.to_string()),
            state,
            ..Session::default()
        }
    }

    fn rejected(message: &str) -> SessionError {
        SessionError::Api {
            status: 400,
            body: message.to_string(),
        }
    }
}

impl SessionApi for ScriptedSessions {
    fn create_session(&self, request: &CreateSessionRequest) -> Result<Session, SessionError> {
        self.calls
            .borrow_mut()
            .push(SessionCall::Create(request.starting_branch.clone()));
        if self.fail_create.get() {
            return Err(Self::rejected("scripted create failure"));
        }
        self.created.borrow_mut().push(request.clone());
        let id = format!("created-{}", self.created.borrow().len());
        self.set_state(&id, SessionState::Queued);
        Ok(self.session(&id))
    }

    fn get_session(&self, id: &str) -> Result<Session, SessionError> {
        self.calls.borrow_mut().push(SessionCall::Get(id.to_string()));
        if self.forgotten.borrow().contains(id) {
            return Err(SessionError::Api {
                status: 404,
                body: format!("session {id} not found"),
            });
        }
        Ok(self.session(id))
    }

    fn send_message(&self, id: &str, text: &str) -> Result<(), SessionError> {
        self.calls
            .borrow_mut()
            .push(SessionCall::Send(id.to_string(), text.to_string()));
        if self.fail_send.get() {
            return Err(Self::rejected("scripted send failure"));
        }
        Ok(())
    }

    fn approve_plan(&self, id: &str) -> Result<(), SessionError> {
        self.calls
            .borrow_mut()
            .push(SessionCall::Approve(id.to_string()));
        Ok(())
    }

    fn list_activities(
        &self,
        id: &str,
        _created_after: Option<&str>,
    ) -> Result<Vec<Activity>, SessionError> {
        self.calls
            .borrow_mut()
            .push(SessionCall::Activities(id.to_string()));
        Ok(Vec::new())
    }
}

/// In-memory [`PullRequests`]. Posted comments are appended to the stored
/// snapshot at the scripted clock time, so later cycles see them.
#[derive(Debug)]
pub struct ScriptedPullRequests {
    pub fail_list: Cell<bool>,
    snapshots: RefCell<Vec<PrSnapshot>>,
    unreadable: RefCell<BTreeSet<u64>>,
    posted: RefCell<Vec<(u64, String)>>,
    base_sha: RefCell<Option<String>>,
    clock: Cell<DateTime<Utc>>,
    list_calls: Cell<usize>,
}

impl ScriptedPullRequests {
    pub fn with(snapshots: Vec<PrSnapshot>) -> Self {
        Self {
            fail_list: Cell::new(false),
            snapshots: RefCell::new(snapshots),
            unreadable: RefCell::default(),
            posted: RefCell::default(),
            base_sha: RefCell::new(Some("0123abc".to_string())),
            clock: Cell::new(ts("2024-06-01T00:00:00Z")),
            list_calls: Cell::new(0),
        }
    }

    pub fn fail_snapshot(&self, number: u64) {
        self.unreadable.borrow_mut().insert(number);
    }

    pub fn set_base_sha(&self, sha: Option<String>) {
        *self.base_sha.borrow_mut() = sha;
    }

    /// Timestamp given to comments posted from now on.
    pub fn set_clock(&self, at: &str) {
        self.clock.set(ts(at));
    }

    /// Simulate the agent pushing to PR `number`.
    pub fn push_commit(&self, number: u64, commit: Commit) {
        if let Some(snap) = self
            .snapshots
            .borrow_mut()
            .iter_mut()
            .find(|snap| snap.number == number)
        {
            snap.commits.push(commit);
        }
    }

    pub fn posted(&self) -> Vec<(u64, String)> {
        self.posted.borrow().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.get()
    }
}

impl PullRequests for ScriptedPullRequests {
    fn list_open(&self, author: &str) -> Result<Vec<PrSummary>> {
        self.list_calls.set(self.list_calls.get() + 1);
        if self.fail_list.get() {
            bail!("scripted list failure");
        }
        Ok(self
            .snapshots
            .borrow()
            .iter()
            .map(|snap| PrSummary {
                number: snap.number,
                title: snap.title.clone(),
                head_branch: snap.head_branch.clone(),
                url: snap.url.clone(),
                author: author.to_string(),
                is_draft: snap.is_draft,
            })
            .collect())
    }

    fn snapshot(&self, number: u64) -> Result<PrSnapshot> {
        if self.unreadable.borrow().contains(&number) {
            bail!("scripted snapshot failure for #{number}");
        }
        self.snapshots
            .borrow()
            .iter()
            .find(|snap| snap.number == number)
            .cloned()
            .ok_or_else(|| anyhow!("no pull request #{number}"))
    }

    fn post_comment(&self, number: u64, body: &str) -> Result<()> {
        let mut snapshots = self.snapshots.borrow_mut();
        let snap = snapshots
            .iter_mut()
            .find(|snap| snap.number == number)
            .ok_or_else(|| anyhow!("no pull request #{number}"))?;
        snap.comments.push(Comment {
            author: "overseer-bot".to_string(),
            body: body.to_string(),
            created_at: Some(self.clock.get()),
        });
        if let Some(id) = session_id::from_comments(&snap.comments) {
            snap.session_id = Some(id);
        }
        self.posted.borrow_mut().push((number, body.to_string()));
        Ok(())
    }

    fn base_sha(&self, _base_branch: &str) -> Option<String> {
        self.base_sha.borrow().clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchCall {
    Fetch,
    Exists(String),
    DeleteLocal(String),
    CreateLocal(String),
    Push(String),
}

/// [`BranchRemote`] that records calls against an in-memory set of remote
/// branches.
#[derive(Debug, Default)]
pub struct RecordingBranchRemote {
    pub fail_fetch: bool,
    pub fail_exists: bool,
    pub fail_push: bool,
    remote: RefCell<BTreeSet<String>>,
    calls: RefCell<Vec<BranchCall>>,
}

impl RecordingBranchRemote {
    pub fn with_remote_branches(names: &[&str]) -> Self {
        Self {
            remote: RefCell::new(names.iter().map(|name| name.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<BranchCall> {
        self.calls.borrow().clone()
    }

    fn record(&self, call: BranchCall) {
        self.calls.borrow_mut().push(call);
    }
}

impl BranchRemote for RecordingBranchRemote {
    fn fetch_default(&self) -> Result<()> {
        self.record(BranchCall::Fetch);
        if self.fail_fetch {
            bail!("scripted fetch failure");
        }
        Ok(())
    }

    fn remote_branch_exists(&self, name: &str) -> Result<bool> {
        self.record(BranchCall::Exists(name.to_string()));
        if self.fail_exists {
            bail!("scripted ls-remote failure");
        }
        Ok(self.remote.borrow().contains(name))
    }

    fn delete_local_branch(&self, name: &str) -> Result<()> {
        self.record(BranchCall::DeleteLocal(name.to_string()));
        Ok(())
    }

    fn create_local_from_default(&self, name: &str) -> Result<()> {
        self.record(BranchCall::CreateLocal(name.to_string()));
        Ok(())
    }

    fn push_branch(&self, name: &str) -> Result<()> {
        self.record(BranchCall::Push(name.to_string()));
        if self.fail_push {
            bail!("scripted push rejection");
        }
        self.remote.borrow_mut().insert(name.to_string());
        Ok(())
    }
}

/// [`StateMirror`] that keeps every upload as `(contents, message)`.
#[derive(Debug, Default)]
pub struct RecordingMirror {
    fail: bool,
    uploads: RefCell<Vec<(String, String)>>,
}

impl RecordingMirror {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.borrow().clone()
    }
}

impl StateMirror for RecordingMirror {
    fn mirror(&self, contents: &str, message: &str) -> Result<()> {
        self.uploads
            .borrow_mut()
            .push((contents.to_string(), message.to_string()));
        if self.fail {
            bail!("scripted mirror failure");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum CannedResponse {
    Status { status: u16, body: String },
    /// Close the connection without answering.
    Drop,
    /// Announce a longer body than is sent.
    Truncated,
}

impl CannedResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self::Status {
            status,
            body: body.to_string(),
        }
    }
}

/// One-connection-per-response HTTP server on localhost. Each raw request
/// (request line, headers, body) is recorded before it is answered.
#[derive(Debug)]
pub struct CannedServer {
    addr: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl CannedServer {
    pub fn start(responses: Vec<CannedResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind canned server");
        let addr = listener.local_addr().expect("local addr").to_string();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);
        thread::spawn(move || {
            for response in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let request = read_request(&mut stream);
                recorded.lock().expect("requests lock").push(request);
                respond(&mut stream, &response);
            }
        });
        Self { addr, requests }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests lock").clone()
    }
}

fn read_request(stream: &mut TcpStream) -> String {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    let mut raw = Vec::new();
    let mut chunk = [0_u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_header_end(&raw) {
            break pos;
        }
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return String::from_utf8_lossy(&raw).into_owned(),
            Ok(n) => raw.extend_from_slice(&chunk[..n]),
        }
    };
    let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while raw.len() < header_end + 4 + content_length {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => raw.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&raw).into_owned()
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn respond(stream: &mut TcpStream, response: &CannedResponse) {
    let payload = match response {
        CannedResponse::Drop => return,
        CannedResponse::Truncated => {
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 64\r\nConnection: close\r\n\r\n{\"name\":"
                .to_string()
        }
        CannedResponse::Status { status, body } => format!(
            "HTTP/1.1 {status} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        ),
    };
    let _ = stream.write_all(payload.as_bytes());
    let _ = stream.flush();
}

/// A bare `origin` repository with a `main` branch and a working clone.
pub struct GitRemoteFixture {
    temp: tempfile::TempDir,
    pub origin: PathBuf,
    pub work: PathBuf,
}

impl GitRemoteFixture {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = temp.path().join("origin.git");
        let work = temp.path().join("work");

        git_in(temp.path(), &["init", "--bare", "origin.git"]);
        git_in(&origin, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        clone_origin(temp.path(), "work");
        git_in(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        let fixture = Self { temp, origin, work };
        fixture.commit_file("README.md", "widgets\n", "initial commit");
        git_in(&fixture.work, &["push", "-u", "origin", "main"]);
        fixture
    }

    pub fn git(&self) -> Git {
        Git::new(&self.work, Duration::from_secs(60))
    }

    /// Write `name` in the working clone and commit it on the current branch.
    pub fn commit_file(&self, name: &str, contents: &str, message: &str) {
        commit_in(&self.work, name, contents, message);
    }

    /// Push a new commit to `branch` from a separate clone, leaving the
    /// working clone's remote-tracking refs stale. Returns the pushed SHA.
    pub fn push_from_elsewhere(&self, branch: &str, name: &str) -> String {
        let other = self.temp.path().join("elsewhere");
        if !other.exists() {
            clone_origin(self.temp.path(), "elsewhere");
        }
        let tracking = format!("origin/{branch}");
        let refspec = format!("HEAD:refs/heads/{branch}");
        git_in(&other, &["fetch", "origin"]);
        git_in(&other, &["checkout", "-B", branch, tracking.as_str()]);
        commit_in(&other, name, "pushed elsewhere\n", "commit from another clone");
        git_in(&other, &["push", "origin", refspec.as_str()]);
        git_in(&other, &["rev-parse", "HEAD"]).trim().to_string()
    }

    /// Run git in the working clone, panicking on failure.
    pub fn run(&self, args: &[&str]) -> String {
        git_in(&self.work, args)
    }
}

impl Default for GitRemoteFixture {
    fn default() -> Self {
        Self::new()
    }
}

fn clone_origin(root: &Path, name: &str) {
    git_in(root, &["clone", "origin.git", name]);
    let clone = root.join(name);
    git_in(&clone, &["config", "user.name", "Overseer Tests"]);
    git_in(&clone, &["config", "user.email", "overseer@example.com"]);
    git_in(&clone, &["config", "commit.gpgsign", "false"]);
}

fn commit_in(dir: &Path, name: &str, contents: &str, message: &str) {
    std::fs::write(dir.join(name), contents).expect("write fixture file");
    git_in(dir, &["add", "-A"]);
    git_in(dir, &["commit", "-m", message]);
}

fn git_in(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}
