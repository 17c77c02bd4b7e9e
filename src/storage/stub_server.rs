// 本地 HTTP 桩服务（仅测试）
//
// 按顺序返回预设响应；每个连接只处理一个请求，响应带 Connection: close。
// 可限制读取请求体的速度，模拟慢速上行链路。

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// 预设响应
#[derive(Debug, Clone, Default)]
pub(crate) struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// 读完请求后等待多久再响应
    pub delay: Duration,
}

impl StubResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// 收到的请求
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    /// 请求行中的 path + query
    pub target: String,
    pub body_len: usize,
}

/// 每次读取的字节数上限和两次读取之间的间隔
type Throttle = Option<(usize, Duration)>;

pub(crate) struct StubServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl StubServer {
    pub async fn start(responses: Vec<StubResponse>) -> Self {
        Self::spawn(responses, None).await
    }

    /// 每次最多读取 `chunk` 字节请求体，读取后等待 `interval`
    pub async fn start_throttled(responses: Vec<StubResponse>, chunk: usize, interval: Duration) -> Self {
        Self::spawn(responses, Some((chunk, interval))).await
    }

    async fn spawn(responses: Vec<StubResponse>, throttle: Throttle) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let mut responses: VecDeque<StubResponse> = responses.into();

        let recorded = requests.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let _ = handle(stream, &mut responses, &recorded, throttle).await;
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle(
    mut stream: TcpStream,
    responses: &mut VecDeque<StubResponse>,
    requests: &Mutex<Vec<RecordedRequest>>,
    throttle: Throttle,
) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Ok(());
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut buffer = vec![0u8; 64 * 1024];
    let mut received = 0;
    while received < content_length {
        let limit = match throttle {
            Some((chunk, _)) => chunk.min(buffer.len()),
            None => buffer.len(),
        };
        let want = limit.min(content_length - received);
        let n = stream.read(&mut buffer[..want]).await?;
        if n == 0 {
            break;
        }
        received += n;
        if let Some((_, interval)) = throttle {
            tokio::time::sleep(interval).await;
        }
    }

    requests.lock().push(RecordedRequest {
        method: method.clone(),
        target,
        body_len: received,
    });

    let response = responses.pop_front().unwrap_or_else(|| StubResponse::new(500));
    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    let mut out = format!("HTTP/1.1 {} STUB\r\nConnection: close\r\n", response.status);
    for (name, value) in &response.headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    // HEAD 响应可以自带 Content-Length，但不写响应体
    if !response
        .headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("content-length"))
    {
        out.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    }
    out.push_str("\r\n");
    if method != "HEAD" {
        out.push_str(&response.body);
    }

    stream.write_all(out.as_bytes()).await?;
    stream.shutdown().await
}
