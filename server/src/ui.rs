//! The upload form served at `/`.

const FORM_TEMPLATE: &str = r##"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>peoplespot</title>
<style>
  body { font-family: system-ui, sans-serif; margin: 2rem; background: #fafafa; }
  .row { display: flex; gap: 2rem; flex-wrap: wrap; }
  .col { flex: 1 1 24rem; background: #fff; padding: 1rem; border-radius: 8px; box-shadow: 0 1px 3px #0002; }
  label { display: block; margin: 0.75rem 0 0.25rem; font-weight: 600; }
  video { width: 100%; max-height: 60vh; background: #000; }
  #status { margin-top: 0.75rem; min-height: 1.2em; color: #555; }
  button, .download { margin-top: 1rem; padding: 0.5rem 1rem; }
  .download[aria-disabled="true"] { pointer-events: none; opacity: 0.4; }
</style>
</head>
<body>
<div class="row">
  <div class="col">
    <form id="predict-form">
      <label for="video">Upload video</label>
      <input id="video" name="video" type="file" accept="video/*" required>
      <label for="conf">Model confidence: <output id="conf-value">{{DEFAULT_CONF}}</output></label>
      <input id="conf" name="conf" type="range" min="0" max="1" step="0.05" value="{{DEFAULT_CONF}}">
      <button id="process" type="submit">Process video</button>
    </form>
    <div id="status"></div>
  </div>
  <div class="col">
    <label for="result">Predictions</label>
    <video id="result" controls></video>
    <a id="download" class="download" href="#" aria-disabled="true" download>Download video</a>
  </div>
</div>
<script>
  const form = document.getElementById("predict-form");
  const conf = document.getElementById("conf");
  const confValue = document.getElementById("conf-value");
  const statusLine = document.getElementById("status");
  const button = document.getElementById("process");
  const result = document.getElementById("result");
  const download = document.getElementById("download");

  conf.addEventListener("input", () => { confValue.textContent = conf.value; });

  form.addEventListener("submit", async (event) => {
    event.preventDefault();
    button.disabled = true;
    statusLine.textContent = "Processing…";
    try {
      const response = await fetch("/api/predict", { method: "POST", body: new FormData(form) });
      const body = await response.json();
      if (!response.ok) {
        throw new Error(body.detail || response.statusText);
      }
      result.src = body.video;
      download.href = body.download;
      download.setAttribute("aria-disabled", "false");
      statusLine.textContent = `${body.frames} frames at ${body.fps.toFixed(2)} fps`;
    } catch (err) {
      statusLine.textContent = `Error: ${err.message}`;
    } finally {
      button.disabled = false;
    }
  });
</script>
</body>
</html>
"##;

/// The form with the slider preset to `default_confidence`.
pub fn render_form(default_confidence: f32) -> String {
    FORM_TEMPLATE.replace("{{DEFAULT_CONF}}", &format_confidence(default_confidence))
}

/// Slider values are multiples of 0.05, so two decimals are exact.
fn format_confidence(conf: f32) -> String {
    let text = format!("{conf:.2}");
    match text.trim_end_matches('0').trim_end_matches('.') {
        "" => "0".to_string(),
        trimmed => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slider_uses_configured_default() {
        let html = render_form(0.45);
        assert!(html.contains(r#"type="range" min="0" max="1" step="0.05" value="0.45""#));
        assert!(!html.contains("{{"));
    }

    #[test]
    fn confidence_formatting_drops_trailing_zeros() {
        assert_eq!(format_confidence(0.45), "0.45");
        assert_eq!(format_confidence(0.5), "0.5");
        assert_eq!(format_confidence(1.0), "1");
        assert_eq!(format_confidence(0.0), "0");
    }
}
