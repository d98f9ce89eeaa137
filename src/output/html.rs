//! Inline pages for `/` and `/login`.

const INDEX_TEMPLATE: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Vote tracker</title>
<style>
body { font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 56rem; }
table { border-collapse: collapse; width: 100%; }
td, th { border-bottom: 1px solid #ddd; padding: .3rem .6rem; text-align: left; }
nav { float: right; }
</style>
</head>
<body>
<nav>__NAV__</nav>
<h1>Vote tracker</h1>
<p id="updated">Loading&hellip;</p>
<table id="current"></table>
<h2>History</h2>
<select id="interval">
<option>10m</option><option>30m</option><option>1h</option><option>5h</option>
<option selected>1d</option><option>3d</option><option>7d</option>
</select>
<table id="history"></table>
<script>
const IS_AUTHENTICATED = __IS_AUTHENTICATED__;
const ENTITIES = { "&": "&amp;", "<": "&lt;", ">": "&gt;", '"': "&quot;", "'": "&#39;" };
function esc(value) {
  return String(value).replace(/[&<>"']/g, ch => ENTITIES[ch]);
}
function rows(candidates) {
  return candidates.map(c => `<tr><td>${esc(c.name)}</td><td>${esc(Number(c.percent).toFixed(2))}%</td>` +
    (IS_AUTHENTICATED && c.real_percent !== undefined ? `<td>${esc(c.real_percent)}</td>` : "") + "</tr>").join("");
}
async function loadCurrent() {
  const data = await (await fetch("/api/vote-data")).json();
  const boards = "candidates" in data || "last_update" in data ? { "": data } : data;
  let html = "";
  let updated = [];
  for (const [board, snap] of Object.entries(boards)) {
    if (!snap) { continue; }
    updated.push((board ? board + ": " : "") + snap.last_update);
    html += (board ? `<tr><th colspan="2">${esc(board)}</th></tr>` : "") + rows(snap.candidates);
  }
  document.getElementById("updated").textContent = updated.length ? "Last update " + updated.join(", ") : "No data yet";
  document.getElementById("current").innerHTML = html;
}
async function loadHistory() {
  const interval = document.getElementById("interval").value;
  const res = await fetch(`/api/history?interval=${encodeURIComponent(interval)}`);
  if (!res.ok) { document.getElementById("history").innerHTML = `<tr><td>${esc(res.status)}</td></tr>`; return; }
  const snaps = await res.json();
  document.getElementById("history").innerHTML = snaps.map(s =>
    `<tr><th colspan="2">${esc(s.timestamp)}</th></tr>` + rows(s.candidates)).join("");
}
document.getElementById("interval").addEventListener("change", loadHistory);
loadCurrent(); loadHistory();
setInterval(loadCurrent, 60000);
</script>
</body>
</html>
"#;

const LOGIN_TEMPLATE: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Sign in</title>
<style>
body { font-family: system-ui, sans-serif; margin: 4rem auto; max-width: 22rem; }
label, input, button { display: block; width: 100%; margin-bottom: .6rem; }
.error { color: #b00020; }
</style>
</head>
<body>
<h1>Sign in</h1>
__ERROR__
<form method="post" action="/login">
<label>Username <input name="username" autocomplete="username" required></label>
<label>Password <input name="password" type="password" autocomplete="current-password" required></label>
<button type="submit">Sign in</button>
</form>
</body>
</html>
"#;

pub fn render_index(is_authenticated: bool) -> String {
    let nav = if is_authenticated {
        r#"<a href="/logout">Sign out</a>"#
    } else {
        r#"<a href="/login">Sign in</a>"#
    };
    INDEX_TEMPLATE
        .replace("__NAV__", nav)
        .replace("__IS_AUTHENTICATED__", if is_authenticated { "true" } else { "false" })
}

pub fn render_login(error: Option<&str>) -> String {
    let error = error
        .map(|message| format!(r#"<p class="error">{}</p>"#, escape(message)))
        .unwrap_or_default();
    LOGIN_TEMPLATE.replace("__ERROR__", &error)
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_embeds_auth_flag() {
        assert!(render_index(true).contains("const IS_AUTHENTICATED = true;"));
        let anonymous = render_index(false);
        assert!(anonymous.contains("const IS_AUTHENTICATED = false;"));
        assert!(anonymous.contains(r#"href="/login""#));
    }

    #[test]
    fn index_script_escapes_every_interpolated_value() {
        let page = render_index(false);
        let script = page
            .split("<script>")
            .nth(1)
            .and_then(|rest| rest.split("</script>").next())
            .expect("script");
        let mut rest = script;
        let mut interpolations = 0;
        while let Some(start) = rest.find("${") {
            let tail = &rest[start + 2..];
            let end = tail.find('}').expect("closing brace");
            let expr = &tail[..end];
            assert!(
                expr.starts_with("esc(") || expr.starts_with("encodeURIComponent("),
                "unescaped interpolation: {expr}"
            );
            interpolations += 1;
            rest = &tail[end..];
        }
        assert_eq!(interpolations, 7);
        assert!(script.contains("function esc(value)"));
    }

    #[test]
    fn login_error_is_escaped() {
        assert!(!render_login(None).contains("class=\"error\""));
        let page = render_login(Some("<bad>"));
        assert!(page.contains("&lt;bad&gt;"));
    }
}
