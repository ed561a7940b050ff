use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    io::{BufRead, BufReader, Cursor, ErrorKind, Read},
    path::{Path, PathBuf},
    process::{Child, ChildStderr, Command, Stdio},
    time::Duration,
};
use tracing::{debug, error, info, warn};

use super::{
    DecodeError, DecodedStream, LoadedTrack, StreamFormat, TrackLoader, TrackMetadata,
    TrackRequest,
};
use crate::{cache::MetadataCache, config::Config};

/// Client that resolves sources with yt-dlp and decodes them with ffmpeg,
/// streaming MP3 over the subprocess stdout.
pub struct YtDlpLoader {
    ytdlp_bin: String,
    ffmpeg_bin: String,
    work_dir: PathBuf,
    probe_timeout: Duration,
    cache: MetadataCache,
}

impl YtDlpLoader {
    pub fn new(config: &Config, cache: MetadataCache) -> Self {
        Self {
            ytdlp_bin: config.ytdlp_bin.clone(),
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            work_dir: config.work_dir.clone(),
            probe_timeout: config.probe_timeout,
            cache,
        }
    }

    /// Verifies that yt-dlp and ffmpeg are available
    pub async fn verify_dependencies(&self) -> anyhow::Result<()> {
        let ytdlp_check = async_process::Command::new(&self.ytdlp_bin)
            .arg("--version")
            .output()
            .await;

        match ytdlp_check {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!("✅ yt-dlp version: {}", version.trim());
            }
            _ => {
                error!("❌ {} not found. Install with: pip install yt-dlp", self.ytdlp_bin);
                anyhow::bail!("yt-dlp not available");
            }
        }

        let ffmpeg_check = async_process::Command::new(&self.ffmpeg_bin)
            .arg("-version")
            .output()
            .await;

        match ffmpeg_check {
            Ok(output) if output.status.success() => {
                info!("✅ ffmpeg available");
            }
            _ => {
                error!("❌ {} not found. Install with: sudo apt install ffmpeg", self.ffmpeg_bin);
                anyhow::bail!("ffmpeg not available");
            }
        }

        Ok(())
    }

    /// Full argument list for one decode. The pipeline is fixed; only the
    /// position hints and the source vary.
    pub fn command_args(&self, request: &TrackRequest) -> Vec<String> {
        let exec = format!(
            "{} -hide_banner -nostats -loglevel panic -y -i {{}} -vn -q:a 5 -f mp3 pipe:1",
            self.ffmpeg_bin
        );
        let output_template = self.work_dir.join("%(id)s.%(ext)s");

        let mut args: Vec<String> = vec![
            "--quiet".into(),
            "--no-progress".into(),
            "--write-info-json".into(),
            "-f".into(),
            "worstaudio".into(),
            "--exec".into(),
            exec,
            "-o".into(),
            output_template.to_string_lossy().into_owned(),
        ];
        args.extend(request.hints.to_args());
        args.push("--".into());
        args.push(request.source.clone());
        args
    }

    /// Deterministic sidecar location for a media id.
    pub fn sidecar_path(&self, media_id: &str) -> Option<PathBuf> {
        let safe = !media_id.is_empty()
            && media_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        safe.then(|| self.work_dir.join(format!("{media_id}.info.json")))
    }

    /// Parses the sidecar file. Absent or unreadable metadata is `None`.
    pub fn read_metadata(&self, media_id: &str) -> Option<TrackMetadata> {
        if let Some(cached) = self.cache.get(&media_id.to_string()) {
            return Some(cached);
        }

        let path = self.sidecar_path(media_id)?;
        let metadata = parse_sidecar(&path)?;
        self.cache.insert(media_id.to_string(), metadata.clone());
        Some(metadata)
    }

    async fn start(&self, request: &TrackRequest) -> Result<LoadedTrack, DecodeError> {
        let args = self.command_args(request);
        let label = request
            .media_id
            .clone()
            .unwrap_or_else(|| request.source.clone());

        debug!("🎵 Launching {} {:?}", self.ytdlp_bin, args);

        let mut command = Command::new(&self.ytdlp_bin);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // ffmpeg and other helpers join this group and die with it
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|source| DecodeError::Spawn {
                program: self.ytdlp_bin.clone(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            drain_diagnostics(stderr, label.clone());
        }

        let stdout = child.stdout.take();
        // From here on the process is killed on every early return
        let process = DecodeProcess::new(child, label.clone());

        let stdout = stdout
            .ok_or_else(|| DecodeError::Io(std::io::Error::other("stdout was not captured")))?;

        let probe = tokio::task::spawn_blocking(move || read_prefix(stdout, StreamFormat::SNIFF_LEN));
        let (prefix, stdout) = match tokio::time::timeout(self.probe_timeout, probe).await {
            Ok(Ok(Ok(read))) => read,
            Ok(Ok(Err(e))) => return Err(DecodeError::Io(e)),
            Ok(Err(join)) => return Err(DecodeError::Io(std::io::Error::other(join))),
            Err(_) => {
                return Err(DecodeError::UnsupportedStream(format!(
                    "no audio from {} within {}",
                    label,
                    humantime::format_duration(self.probe_timeout)
                )))
            }
        };

        let Some(format) = StreamFormat::sniff(&prefix) else {
            warn!(
                "Could not queue audio for {}: {} bytes of unrecognized output",
                label,
                prefix.len()
            );
            process.terminate();
            return Err(DecodeError::UnsupportedStream(if prefix.is_empty() {
                format!("{label} produced no output")
            } else {
                format!("{label} is not decodable audio")
            }));
        };

        info!("🎶 Decoding {} as {}", label, format.extension());

        let reader = Cursor::new(prefix).chain(stdout);
        Ok(LoadedTrack {
            stream: DecodedStream::new(reader, format),
            process: Some(process),
        })
    }
}

#[async_trait]
impl TrackLoader for YtDlpLoader {
    async fn load(&self, request: &TrackRequest) -> Result<LoadedTrack, DecodeError> {
        self.start(request).await
    }

    async fn metadata(&self, media_id: &str) -> Option<TrackMetadata> {
        self.read_metadata(media_id)
    }
}

/// Handle on a running decode subprocess and the process group it leads.
/// Killing is idempotent and also happens on drop, so a discarded track
/// never leaks its processes.
#[derive(Debug)]
pub struct DecodeProcess {
    child: Mutex<Option<Child>>,
    label: String,
}

impl DecodeProcess {
    pub fn new(child: Child, label: String) -> Self {
        Self {
            child: Mutex::new(Some(child)),
            label,
        }
    }

    /// Force-kills the process group and reaps the leader.
    pub fn terminate(&self) {
        let Some(mut child) = self.child.lock().take() else {
            return;
        };
        // the leader is not reaped yet, so its pid still names the group
        kill_group(&child, &self.label);

        match child.try_wait() {
            Ok(Some(status)) => debug!("Decoder for {} already exited ({})", self.label, status),
            _ => {
                if let Err(e) = child.kill() {
                    warn!("Could not kill decoder for {}: {}", self.label, e);
                }
                if let Err(e) = child.wait() {
                    warn!("Could not reap decoder for {}: {}", self.label, e);
                } else {
                    debug!("🔪 Decoder for {} terminated", self.label);
                }
            }
        }
    }
}

impl Drop for DecodeProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(unix)]
fn kill_group(child: &Child, label: &str) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory of ours
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        let e = std::io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::ESRCH) {
            warn!("Could not kill process group of {}: {}", label, e);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child, _label: &str) {}

/// Reads and logs diagnostics on the blocking pool until the pipe closes.
/// Invalid UTF-8 is logged lossily so the pipe keeps draining.
fn drain_diagnostics(stderr: ChildStderr, label: String) {
    tokio::task::spawn_blocking(move || {
        let mut reader = BufReader::new(stderr);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim_end();
                    if !text.is_empty() {
                        info!("[yt-dl] {}", text);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Could not read diagnostics for {}: {}", label, e);
                    break;
                }
            }
        }
        debug!("Diagnostics for {} closed", label);
    });
}

/// Reads up to `len` bytes, stopping early only at end of stream.
fn read_prefix<R: Read>(mut reader: R, len: usize) -> std::io::Result<(Vec<u8>, R)> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok((buf, reader))
}

fn parse_sidecar(path: &Path) -> Option<TrackMetadata> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Could not get video metadata from {}: {}", path.display(), e);
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            warn!("Could not parse video metadata in {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loader(dir: &Path) -> YtDlpLoader {
        let config = Config {
            work_dir: dir.to_path_buf(),
            ytdlp_bin: "yt-dlp".into(),
            ffmpeg_bin: "ffmpeg".into(),
            ..Config::default()
        };
        YtDlpLoader::new(&config, MetadataCache::new(8, Some(Duration::from_secs(60))))
    }

    #[test]
    fn command_line_matches_fixed_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let mut request = TrackRequest::url("https://example.com/list", Default::default());
        request.hints.start = Some("2".into());
        request.hints.end = Some("5".into());

        let args = loader.command_args(&request);
        assert_eq!(args[0], "--quiet");
        assert!(args.contains(&"--write-info-json".to_string()));
        let exec_at = args.iter().position(|a| a == "--exec").unwrap();
        assert!(args[exec_at + 1].starts_with("ffmpeg -hide_banner"));
        assert!(args[exec_at + 1].ends_with("-f mp3 pipe:1"));

        let tail: Vec<&str> = args[args.len() - 6..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec!["--playlist-start", "2", "--playlist-end", "5", "--", "https://example.com/list"]
        );
    }

    #[test]
    fn reads_sidecar_metadata() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("abc123.info.json"),
            r#"{"id":"abc123","title":"Never Gonna","duration":213,"webpage_url":"https://www.youtube.com/watch?v=abc123","formats":[]}"#,
        )
        .unwrap();

        let loader = loader(dir.path());
        let metadata = loader.read_metadata("abc123").unwrap();
        assert_eq!(metadata.title, "Never Gonna");
        assert_eq!(metadata.duration_seconds, Some(213));

        // served from cache once the file is gone
        std::fs::remove_file(dir.path().join("abc123.info.json")).unwrap();
        assert!(loader.read_metadata("abc123").is_some());
    }

    #[test]
    fn missing_or_broken_sidecar_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.info.json"), "{not json").unwrap();

        let loader = loader(dir.path());
        assert_eq!(loader.read_metadata("nothere"), None);
        assert_eq!(loader.read_metadata("bad"), None);
        assert_eq!(loader.read_metadata("../etc/passwd"), None);
    }

    #[test]
    fn prefix_read_stops_at_end_of_stream() {
        let (prefix, _) = read_prefix(Cursor::new(b"ID3".to_vec()), 12).unwrap();
        assert_eq!(prefix, b"ID3");

        let (prefix, mut rest) = read_prefix(Cursor::new(b"0123456789abcdef".to_vec()), 12).unwrap();
        assert_eq!(prefix, b"0123456789ab");
        let mut tail = String::new();
        rest.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "cdef");
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            work_dir: dir.path().to_path_buf(),
            ytdlp_bin: "definitely-not-a-real-binary-4711".into(),
            ..Config::default()
        };
        let loader = YtDlpLoader::new(&config, MetadataCache::new(8, None));

        let err = loader.load(&TrackRequest::media("abc")).await.unwrap_err();
        assert!(matches!(err, DecodeError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_audio_output_is_rejected_and_killed() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-ytdlp.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'ERROR: not a video' \nsleep 30\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = Config {
            work_dir: dir.path().to_path_buf(),
            ytdlp_bin: script.to_string_lossy().into_owned(),
            probe_timeout: Duration::from_secs(5),
            ..Config::default()
        };
        let loader = YtDlpLoader::new(&config, MetadataCache::new(8, None));

        let err = loader.load(&TrackRequest::media("abc")).await.unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedStream(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn audio_prefix_is_preserved_in_stream() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-ytdlp.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'progress' 1>&2\nprintf 'ID3rest-of-the-audio'\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = Config {
            work_dir: dir.path().to_path_buf(),
            ytdlp_bin: script.to_string_lossy().into_owned(),
            ..Config::default()
        };
        let loader = YtDlpLoader::new(&config, MetadataCache::new(8, None));

        let loaded = loader.load(&TrackRequest::media("abc")).await.unwrap();
        assert_eq!(loaded.stream.format(), StreamFormat::Mp3);
        let mut bytes = Vec::new();
        let mut reader = loaded.stream.into_reader();
        tokio::task::spawn_blocking(move || {
            reader.read_to_end(&mut bytes).unwrap();
            bytes
        })
        .await
        .map(|bytes| assert_eq!(bytes, b"ID3rest-of-the-audio"))
        .unwrap();

        let process = loaded.process.unwrap();
        process.terminate();
        process.terminate();
        assert!(process.child.lock().is_none());
    }

    /// True once `pid` is gone or only a zombie waiting for init.
    #[cfg(target_os = "linux")]
    fn is_dead(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn terminate_kills_helpers_spawned_by_the_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("helper.pid");
        let script = dir.path().join("fake-ytdlp.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nsleep 30 >/dev/null 2>&1 &\necho $! > '{}'\nprintf 'ID3rest-of-the-audio'\nwait\n",
                pid_file.display()
            ),
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = Config {
            work_dir: dir.path().to_path_buf(),
            ytdlp_bin: script.to_string_lossy().into_owned(),
            ..Config::default()
        };
        let loader = YtDlpLoader::new(&config, MetadataCache::new(8, None));

        let loaded = loader.load(&TrackRequest::media("abc")).await.unwrap();
        let helper: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!is_dead(helper));

        loaded.process.unwrap().terminate();

        let mut dead = false;
        for _ in 0..50 {
            if is_dead(helper) {
                dead = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(dead, "helper {helper} outlived the decoder");
    }
}
