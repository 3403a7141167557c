use anstyle::{Ansi256Color, AnsiColor, Color, RgbColor};

/// Parses a colour written as an ANSI name (`red`, `bright_cyan`), a 256-colour
/// index (`208`) or a hex triplet (`#ff8800`).
pub fn parse_color(raw: &str) -> Option<Color> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix('#') {
        return parse_hex(hex);
    }
    if let Ok(index) = raw.parse::<u8>() {
        return Some(Color::Ansi256(Ansi256Color(index)));
    }
    let name = raw.to_ascii_lowercase().replace(['-', ' '], "_");
    let ansi = match name.as_str() {
        "black" => AnsiColor::Black,
        "red" => AnsiColor::Red,
        "green" => AnsiColor::Green,
        "yellow" => AnsiColor::Yellow,
        "blue" => AnsiColor::Blue,
        "magenta" => AnsiColor::Magenta,
        "cyan" => AnsiColor::Cyan,
        "white" => AnsiColor::White,
        "bright_black" | "gray" | "grey" => AnsiColor::BrightBlack,
        "bright_red" => AnsiColor::BrightRed,
        "bright_green" => AnsiColor::BrightGreen,
        "bright_yellow" => AnsiColor::BrightYellow,
        "bright_blue" => AnsiColor::BrightBlue,
        "bright_magenta" => AnsiColor::BrightMagenta,
        "bright_cyan" => AnsiColor::BrightCyan,
        "bright_white" => AnsiColor::BrightWhite,
        _ => return None,
    };
    Some(Color::Ansi(ansi))
}

fn parse_hex(hex: &str) -> Option<Color> {
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
    Some(Color::Rgb(RgbColor(
        channel(0..2)?,
        channel(2..4)?,
        channel(4..6)?,
    )))
}

/// Inverse of [`parse_color`], used when reporting box state.
pub fn color_name(color: Color) -> String {
    match color {
        Color::Ansi(ansi) => match ansi {
            AnsiColor::Black => "black",
            AnsiColor::Red => "red",
            AnsiColor::Green => "green",
            AnsiColor::Yellow => "yellow",
            AnsiColor::Blue => "blue",
            AnsiColor::Magenta => "magenta",
            AnsiColor::Cyan => "cyan",
            AnsiColor::White => "white",
            AnsiColor::BrightBlack => "bright_black",
            AnsiColor::BrightRed => "bright_red",
            AnsiColor::BrightGreen => "bright_green",
            AnsiColor::BrightYellow => "bright_yellow",
            AnsiColor::BrightBlue => "bright_blue",
            AnsiColor::BrightMagenta => "bright_magenta",
            AnsiColor::BrightCyan => "bright_cyan",
            AnsiColor::BrightWhite => "bright_white",
        }
        .to_owned(),
        Color::Ansi256(index) => index.0.to_string(),
        Color::Rgb(RgbColor(r, g, b)) => format!("#{r:02x}{g:02x}{b:02x}"),
    }
}
