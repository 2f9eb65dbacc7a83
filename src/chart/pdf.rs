use super::ChartError;
use super::layout::{ChartPage, Shape, Stroke, TextShape};
use super::style::Rgb;
use printpdf::path::{PaintMode, WindingOrder};
use printpdf::{
    BuiltinFont, Color, IndirectFontRef, Line, LineDashPattern, Mm, PdfDocument, PdfLayerReference, Point, Polygon,
    TextMatrix,
};
use tracing::debug;

fn mm(points: f64) -> Mm {
    Mm((points * 25.4 / 72.0) as f32)
}

fn point(x: f64, y: f64) -> (Point, bool) {
    (Point::new(mm(x), mm(y)), false)
}

fn color(rgb: Rgb) -> Color {
    let (r, g, b) = rgb.unit();
    Color::Rgb(printpdf::Rgb::new(r, g, b, None))
}

struct Fonts {
    regular: IndirectFontRef,
    bold: IndirectFontRef,
}

/// Render a laid out page into a single-page PDF document.
pub fn render_pdf(page: &ChartPage, title: &str) -> Result<Vec<u8>, ChartError> {
    let (doc, page_idx, layer_idx) = PdfDocument::new(title, mm(page.width), mm(page.height), "chart");
    let layer = doc.get_page(page_idx).get_layer(layer_idx);

    let fonts = Fonts {
        regular: doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(|e| ChartError::Pdf(e.to_string()))?,
        bold: doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(|e| ChartError::Pdf(e.to_string()))?,
    };

    for shape in &page.shapes {
        draw_shape(&layer, shape, &fonts);
    }

    let bytes = doc.save_to_bytes().map_err(|e| ChartError::Pdf(e.to_string()))?;
    debug!(shapes = page.shapes.len(), size = bytes.len(), "Rendered chart PDF");
    Ok(bytes)
}

fn apply_stroke(layer: &PdfLayerReference, stroke: &Stroke) {
    layer.set_outline_color(color(stroke.color));
    layer.set_outline_thickness(stroke.width as f32);
    let pattern = match stroke.dash {
        Some((dash, gap)) => LineDashPattern {
            dash_1: Some(dash.round().max(1.0) as i64),
            gap_1: Some(gap.round().max(1.0) as i64),
            ..LineDashPattern::default()
        },
        None => LineDashPattern::default(),
    };
    layer.set_line_dash_pattern(pattern);
}

fn draw_shape(layer: &PdfLayerReference, shape: &Shape, fonts: &Fonts) {
    match shape {
        Shape::Rect { x, y, width, height, fill, stroke } => {
            let mode = match (fill, stroke) {
                (Some(_), Some(_)) => PaintMode::FillStroke,
                (Some(_), None) => PaintMode::Fill,
                (None, Some(_)) => PaintMode::Stroke,
                (None, None) => return,
            };
            if let Some(fill) = fill {
                layer.set_fill_color(color(*fill));
            }
            if let Some(stroke) = stroke {
                apply_stroke(layer, stroke);
            }
            layer.add_polygon(Polygon {
                rings: vec![vec![
                    point(*x, *y),
                    point(x + width, *y),
                    point(x + width, y + height),
                    point(*x, y + height),
                ]],
                mode,
                winding_order: WindingOrder::NonZero,
            });
        }
        Shape::Line { points, stroke } => {
            if points.len() < 2 {
                return;
            }
            apply_stroke(layer, stroke);
            layer.add_line(Line {
                points: points.iter().map(|(x, y)| point(*x, *y)).collect(),
                is_closed: false,
            });
        }
        Shape::Text(text) => draw_text(layer, text, fonts),
    }
}

fn draw_text(layer: &PdfLayerReference, text: &TextShape, fonts: &Fonts) {
    let font = if text.bold { &fonts.bold } else { &fonts.regular };
    let (sin, cos) = text.rotation.to_radians().sin_cos();

    layer.begin_text_section();
    layer.set_fill_color(color(text.color));
    layer.set_font(font, text.size as f32);
    // Text matrix operands are in points: rotate then translate
    layer.set_text_matrix(TextMatrix::Raw([
        cos as f32,
        sin as f32,
        -sin as f32,
        cos as f32,
        text.x as f32,
        text.y as f32,
    ]));
    layer.write_text(text.text.as_str(), font);
    layer.end_text_section();
}
