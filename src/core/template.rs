use crate::core::card::{Card, CardLayer, LayerKind, TextAlign};
use crate::core::resources::ResourceBundle;

pub const ROOT_ID: &str = "card-root";

/// Resolves a card URL to what the isolated page should load: the inlined
/// resource when the gate loaded it, nothing when it failed.
fn inline_src(resources: &ResourceBundle, url: &str) -> Option<String> {
    resources.get(url).map(|resource| resource.to_data_url())
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Keeps user-provided CSS values from escaping their declaration.
fn css_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, ';' | '{' | '}' | '<' | '>' | '"' | '\\'))
        .collect()
}

fn px(value: f64) -> String {
    format!("{}px", value)
}

fn font_faces(card: &Card, resources: &ResourceBundle) -> String {
    card.fonts
        .iter()
        .filter_map(|font| {
            let src = inline_src(resources, &font.url)?;
            Some(format!(
                "@font-face {{ font-family: \"{}\"; src: url(\"{}\"); font-weight: {}; font-display: block; }}",
                css_value(&font.family),
                css_value(&src),
                font.weight
            ))
        })
        .collect::<Vec<_>>()
        .join("\n        ")
}

fn root_style(card: &Card, resources: &ResourceBundle) -> String {
    let frame = &card.frame;
    let mut style = vec![
        "position: relative".to_string(),
        format!("width: {}", px(card.width)),
        format!("height: {}", px(card.height)),
        "overflow: hidden".to_string(),
        format!("border-radius: {}", px(frame.border_radius)),
    ];

    if let Some(color) = &frame.background_color {
        style.push(format!("background-color: {}", css_value(color)));
    }
    if let Some(src) = frame
        .background_image
        .as_deref()
        .and_then(|url| inline_src(resources, url))
    {
        style.push(format!("background-image: url({})", css_value(&src)));
        style.push(format!("background-size: {}", frame.background_fit.as_css()));
        style.push("background-position: center".to_string());
        style.push("background-repeat: no-repeat".to_string());
    }
    if frame.border_width > 0.0 {
        style.push(format!(
            "border: {} solid {}",
            px(frame.border_width),
            css_value(frame.border_color.as_deref().unwrap_or("#000000"))
        ));
        style.push("box-sizing: border-box".to_string());
    }
    if let Some(shadow) = &frame.shadow {
        style.push(format!("box-shadow: {}", css_value(shadow)));
    }
    if let Some(zoom) = frame.zoom {
        style.push(format!("transform: scale({})", zoom));
    }

    style.join("; ")
}

fn layer_html(layer: &CardLayer, card: &Card, resources: &ResourceBundle) -> String {
    let mut style = vec![
        "position: absolute".to_string(),
        format!("left: {}", px(layer.x)),
        format!("top: {}", px(layer.y)),
        format!("z-index: {}", layer.z_index),
    ];

    match layer.kind {
        LayerKind::Background | LayerKind::Avatar => {
            let (default_w, default_h) = match layer.kind {
                LayerKind::Background => (card.width, card.height),
                _ => (96.0, 96.0),
            };
            style.push(format!("width: {}", px(layer.width.unwrap_or(default_w))));
            style.push(format!("height: {}", px(layer.height.unwrap_or(default_h))));

            let fit = match layer.kind {
                LayerKind::Avatar => "cover",
                _ => layer.style.fit.as_css(),
            };
            style.push(format!("object-fit: {}", fit));

            if layer.kind == LayerKind::Avatar {
                style.push("border-radius: 50%".to_string());
            }

            match inline_src(resources, &layer.content) {
                Some(src) => format!(
                    r#"<img data-layer="{}" src="{}" style="{}">"#,
                    escape_html(&layer.id),
                    escape_html(&src),
                    style.join("; ")
                ),
                None if layer.kind == LayerKind::Avatar => {
                    style.push("background-color: #e5e7eb".to_string());
                    format!(
                        r#"<div data-layer="{}" style="{}"></div>"#,
                        escape_html(&layer.id),
                        style.join("; ")
                    )
                }
                None => String::new(),
            }
        }
        LayerKind::Text => {
            let text = &layer.style;
            style.push(format!("font-size: {}", px(text.font_size)));
            style.push(format!("color: {}", css_value(&text.color)));
            style.push(format!("font-weight: {}", text.font_weight));
            style.push("line-height: 1.2".to_string());
            style.push("white-space: pre".to_string());
            if let Some(family) = &text.font_family {
                style.push(format!("font-family: \"{}\", sans-serif", css_value(family)));
            }
            if let Some(width) = layer.width {
                style.push(format!("width: {}", px(width)));
                let align = match text.text_align {
                    TextAlign::Left => "left",
                    TextAlign::Center => "center",
                    TextAlign::Right => "right",
                };
                style.push(format!("text-align: {}", align));
            }

            format!(
                r#"<div data-layer="{}" style="{}">{}</div>"#,
                escape_html(&layer.id),
                style.join("; "),
                escape_html(&layer.content)
            )
        }
    }
}

/// In-page readiness gate plus measurement. Resolves to a JSON string with
/// per-image outcomes and the card root's rendered box.
pub fn readiness_script(resource_timeout_ms: u64, settle_delay_ms: u64) -> String {
    format!(
        r#"(async () => {{
    const root = document.getElementById('{root}');
    if (!root) {{
        return JSON.stringify({{ missing: true }});
    }}
    const delay = (ms) => new Promise((resolve) => setTimeout(() => resolve('timeout'), ms));
    const settle = (img) => {{
        if (img.complete) {{
            return Promise.resolve(img.naturalWidth > 0 ? 'loaded' : 'failed');
        }}
        return Promise.race([
            new Promise((resolve) => {{
                img.addEventListener('load', () => resolve('loaded'), {{ once: true }});
                img.addEventListener('error', () => resolve('failed'), {{ once: true }});
            }}),
            delay({timeout}),
        ]);
    }};
    const images = Array.from(root.querySelectorAll('img'));
    const [outcomes] = await Promise.all([
        Promise.all(images.map(settle)),
        Promise.race([document.fonts.ready, delay({timeout})]),
    ]);
    if (images.length === 0) {{
        await delay({settle});
    }}
    const rect = root.getBoundingClientRect();
    return JSON.stringify({{
        missing: false,
        outcomes: images.map((img, i) => ({{ layer: img.dataset.layer || '', outcome: outcomes[i] }})),
        x: rect.left,
        y: rect.top,
        width: rect.width,
        height: rect.height,
    }});
}})()"#,
        root = ROOT_ID,
        timeout = resource_timeout_ms,
        settle = settle_delay_ms,
    )
}

/// Renders the card as a standalone document. Every loaded resource is
/// inlined so the page never touches the network.
pub fn card_html(card: &Card, resources: &ResourceBundle) -> String {
    let layers = card
        .layers_in_paint_order()
        .into_iter()
        .map(|layer| layer_html(layer, card, resources))
        .filter(|html| !html.is_empty())
        .collect::<Vec<_>>()
        .join("\n        ");

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Card</title>
    <style>
        {}
        * {{
            margin: 0;
            padding: 0;
        }}
        html, body {{
            background: transparent;
            overflow: hidden;
        }}
        img {{
            display: block;
        }}
    </style>
</head>
<body>
    <div id="{}" style="{}">
        {}
    </div>
</body>
</html>"#,
        font_faces(card, resources),
        ROOT_ID,
        root_style(card, resources),
        layers
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::card::{CardFrame, FontSource, LayerStyle};
    use crate::core::resources::{LoadedResource, ResourceKind};
    use std::sync::Arc;

    fn card() -> Card {
        Card {
            id: "card".into(),
            width: 350.0,
            height: 500.0,
            frame: CardFrame {
                background_color: Some("#fafafa".into()),
                ..CardFrame::default()
            },
            layers: vec![
                CardLayer {
                    id: "name".into(),
                    kind: LayerKind::Text,
                    x: 24.0,
                    y: 320.0,
                    width: Some(302.0),
                    height: None,
                    content: "<Jordan & Co>".into(),
                    style: LayerStyle {
                        text_align: TextAlign::Center,
                        ..LayerStyle::default()
                    },
                    z_index: 2,
                },
                CardLayer {
                    id: "avatar".into(),
                    kind: LayerKind::Avatar,
                    x: 125.0,
                    y: 80.0,
                    width: Some(100.0),
                    height: Some(100.0),
                    content: "/avatar.png".into(),
                    style: LayerStyle::default(),
                    z_index: 1,
                },
            ],
            fonts: vec![],
        }
    }

    #[test]
    fn text_is_escaped_and_positioned() {
        let html = card_html(&card(), &ResourceBundle::default());
        assert!(html.contains("&lt;Jordan &amp; Co&gt;"));
        assert!(html.contains("left: 24px; top: 320px"));
        assert!(html.contains("text-align: center"));
        assert!(html.contains(r#"id="card-root""#));
    }

    #[test]
    fn missing_avatar_renders_placeholder() {
        let html = card_html(&card(), &ResourceBundle::default());
        assert!(!html.contains("<img"));
        assert!(html.contains("background-color: #e5e7eb"));
    }

    #[test]
    fn loaded_images_are_inlined() {
        let mut resources = ResourceBundle::default();
        resources.insert(
            "/avatar.png",
            LoadedResource {
                kind: ResourceKind::Image,
                resolved: None,
                bytes: Arc::new(vec![0x89, b'P', b'N', b'G']),
                content_type: Some("image/png".into()),
                allow_origin: None,
            },
        );
        let html = card_html(&card(), &resources);
        assert!(html.contains(r#"src="data:image/png;base64,"#));
        assert!(!html.contains("/avatar.png"));
    }

    #[test]
    fn hostile_content_type_stays_inside_the_attribute() {
        let mut resources = ResourceBundle::default();
        let hostile = LoadedResource {
            kind: ResourceKind::Image,
            resolved: None,
            bytes: Arc::new(vec![1, 2, 3]),
            content_type: Some("image/png\" onload=\"alert(1)".into()),
            allow_origin: None,
        };
        resources.insert("/avatar.png", hostile.clone());
        resources.insert(
            "/brand.ttf",
            LoadedResource {
                kind: ResourceKind::Font,
                ..hostile
            },
        );

        let mut card = card();
        card.fonts.push(FontSource {
            family: "Brand".into(),
            url: "/brand.ttf".into(),
            weight: 400,
        });
        let html = card_html(&card, &resources);
        assert!(!html.contains("onload"));
        assert!(!html.contains("alert"));
        assert!(html.contains(r#"src="data:application/octet-stream;base64,"#));
        assert!(html.contains(r#"url("data:font/ttf;base64,"#));
    }

    #[test]
    fn readiness_script_embeds_timeouts() {
        let script = readiness_script(3500, 250);
        assert!(script.contains("delay(3500)"));
        assert!(script.contains("delay(250)"));
        assert!(script.contains("document.fonts.ready"));
    }

    #[test]
    fn css_values_cannot_break_out() {
        assert_eq!(css_value("red; background: url(x)"), "red background: url(x)");
    }
}
