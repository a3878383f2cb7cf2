//! Embedded setup page
//!
//! A single static HTML document driving the setup API with `fetch`. The
//! browser's Basic auth prompt handles credentials.

use crate::error::ProxyBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// Serve the setup page
pub fn serve_setup_page() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .header(CACHE_CONTROL, "no-store")
        .body(
            Full::new(Bytes::from_static(SETUP_HTML.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}

const SETUP_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Gateway setup</title>
<style>
  body { font-family: system-ui, sans-serif; max-width: 760px; margin: 2rem auto; padding: 0 1rem; }
  section { border: 1px solid #ddd; border-radius: 6px; padding: 1rem; margin-bottom: 1rem; }
  textarea { width: 100%; min-height: 12rem; font-family: monospace; }
  pre { background: #f6f6f6; padding: .75rem; overflow-x: auto; white-space: pre-wrap; }
  button { margin-right: .5rem; }
</style>
</head>
<body>
<h1>Gateway setup</h1>

<section>
  <h2>Status</h2>
  <pre id="status">loading…</pre>
  <button onclick="refresh()">Refresh</button>
</section>

<section>
  <h2>Onboarding</h2>
  <p>Extra arguments for <code>onboard --non-interactive</code>, one per line.</p>
  <textarea id="onboard-args"></textarea>
  <button onclick="onboard()">Run onboarding</button>
</section>

<section>
  <h2>Console</h2>
  <select id="console-cmd">
    <option>gateway.start</option>
    <option>gateway.stop</option>
    <option>gateway.restart</option>
    <option>cli.version</option>
    <option>cli.status</option>
    <option>cli.health</option>
    <option>cli.doctor</option>
    <option>cli.logs</option>
    <option>cli.config.get</option>
  </select>
  <input id="console-arg" placeholder="argument">
  <button onclick="runConsole()">Run</button>
</section>

<section>
  <h2>Configuration file</h2>
  <textarea id="config-raw"></textarea>
  <button onclick="loadConfig()">Reload</button>
  <button onclick="saveConfig()">Save</button>
  <button onclick="resetConfig()">Reset</button>
</section>

<section>
  <h2>Pairing</h2>
  <input id="pair-channel" placeholder="channel">
  <input id="pair-code" placeholder="code">
  <button onclick="approvePairing()">Approve</button>
</section>

<section>
  <h2>Backup</h2>
  <a href="/setup/export">Download backup</a>
  <p><input type="file" id="import-file"> <button onclick="importBackup()">Import</button></p>
</section>

<h2>Output</h2>
<pre id="output"></pre>

<script>
const out = document.getElementById('output');

async function call(method, path, body, raw) {
  const init = { method, headers: {} };
  if (body !== undefined) {
    if (raw) { init.body = body; init.headers['Content-Type'] = 'application/gzip'; }
    else { init.body = JSON.stringify(body); init.headers['Content-Type'] = 'application/json'; }
  }
  const res = await fetch(path, init);
  const text = await res.text();
  try { return JSON.parse(text); } catch (_) { return { ok: false, output: text }; }
}

function show(result) {
  out.textContent = result.output !== undefined ? result.output : JSON.stringify(result, null, 2);
}

async function refresh() {
  const status = await call('GET', '/setup/api/status');
  document.getElementById('status').textContent = JSON.stringify(status, null, 2);
}

async function onboard() {
  const args = document.getElementById('onboard-args').value.split('\n').map(s => s.trim()).filter(Boolean);
  out.textContent = 'running…';
  show(await call('POST', '/setup/api/run', { args }));
  refresh();
}

async function runConsole() {
  const cmd = document.getElementById('console-cmd').value;
  const arg = document.getElementById('console-arg').value;
  show(await call('POST', '/setup/api/console', { cmd, arg }));
  refresh();
}

async function loadConfig() {
  const result = await call('GET', '/setup/api/config/raw');
  document.getElementById('config-raw').value = result.content || '';
}

async function saveConfig() {
  const content = document.getElementById('config-raw').value;
  show(await call('POST', '/setup/api/config/raw', { content }));
  refresh();
}

async function resetConfig() {
  if (!confirm('Stop the gateway and delete its configuration?')) return;
  show(await call('POST', '/setup/api/reset', {}));
  refresh();
}

async function approvePairing() {
  const channel = document.getElementById('pair-channel').value;
  const code = document.getElementById('pair-code').value;
  show(await call('POST', '/setup/api/pairing/approve', { channel, code }));
}

async function importBackup() {
  const file = document.getElementById('import-file').files[0];
  if (!file) return;
  show(await call('POST', '/setup/import', await file.arrayBuffer(), true));
  refresh();
}

refresh();
loadConfig();
</script>
</body>
</html>
"##;
