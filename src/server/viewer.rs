//! Viewer module - an OpenSeadragon page reading tiles through the IIIF endpoints.

/// OpenSeadragon release served from cdnjs.
const OPENSEADRAGON_CDN: &str = "https://cdnjs.cloudflare.com/ajax/libs/openseadragon/4.1.0";

/// Escape HTML special characters to prevent XSS attacks.
fn html_escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => result.push_str("&amp;"),
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '"' => result.push_str("&quot;"),
            '\'' => result.push_str("&#x27;"),
            _ => result.push(c),
        }
    }
    result
}

/// URL of the `info.json` document the viewer uses as its tile source.
///
/// `base_url` is the scheme and authority the page was requested on.
pub fn info_url(base_url: &str, frame_id: &str, hdu_index: usize) -> String {
    format!(
        "{}/frames/{}/fits/hdus/{}/info.json",
        base_url.trim_end_matches('/'),
        urlencoding::encode(frame_id),
        hdu_index
    )
}

/// Generate an HTML page with an OpenSeadragon viewer for one HDU.
pub fn generate_viewer_html(frame_id: &str, hdu_index: usize, info_url: &str) -> String {
    let escaped_frame_id = html_escape(frame_id);
    // The URL lands inside a JS string literal
    let escaped_info_url = html_escape(info_url);

    format!(
        r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{escaped_frame_id}/fits/hdus/{hdu_index}</title>
    <script src="{cdn}/openseadragon.min.js"></script>
    <style>
        body {{
            background: #0f0f0f;
            margin: 0;
        }}
        #viewer {{
            width: 800px;
            height: 600px;
            margin: auto;
        }}
    </style>
</head>
<body>
    <div id="viewer"></div>
    <script type="text/javascript">
        const viewer = OpenSeadragon({{
            id: "viewer",
            prefixUrl: "{cdn}/images/",
            tileSources: ["{escaped_info_url}"],
            crossOriginPolicy: "Anonymous"
        }});
    </script>
</body>
</html>"##,
        escaped_frame_id = escaped_frame_id,
        hdu_index = hdu_index,
        cdn = OPENSEADRAGON_CDN,
        escaped_info_url = escaped_info_url,
    )
}
