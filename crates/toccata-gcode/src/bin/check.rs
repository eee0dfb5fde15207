use std::{env, fs, path::Path};

use toccata_gcode::{
    parse_keyword, EvalContext, ExpressionParser, Keyword, NullObjectModel, ParseError,
};

// Walk every expression in a job file with evaluation disabled: syntax
// errors are reported, unknown object-model paths are not.
fn check_source(input: &str) -> Result<(), ParseError> {
    let model = NullObjectModel;
    for (index, line) in input.lines().enumerate() {
        let rest = line.trim_start_matches([' ', '\t']);
        let (keyword, args) = match parse_keyword(rest) {
            Some(found) => found,
            None => continue,
        };
        let needs_expression = match keyword {
            Keyword::If | Keyword::Elif | Keyword::While => true,
            Keyword::Echo | Keyword::Abort => !args.is_empty(),
            Keyword::Else | Keyword::Break => false,
        };
        if !needs_expression {
            continue;
        }

        let context = EvalContext {
            line_number: index as u32 + 1,
            // Pretend to be inside a loop so `iterations` checks out.
            iterations: Some(0),
            last_result: 0,
        };
        let column = line.len() - args.len() + 1;
        let mut parser = ExpressionParser::with_column(args, &model, context, column);
        loop {
            parser.parse_with(false)?;
            if !parser.try_consume(',') {
                break;
            }
        }
        parser.check_for_extra_characters()?;
    }
    Ok(())
}

fn main() {
    let args = env::args().skip(1);
    if args.len() == 0 {
        eprintln!("usage: check <file> [<file>...]");
        std::process::exit(1);
    }

    let mut failed = 0usize;
    for path in args {
        let path_ref = Path::new(&path);
        let input = match fs::read_to_string(path_ref) {
            Ok(s) => s,
            Err(err) => {
                eprintln!("{path}: read error: {err}");
                failed += 1;
                continue;
            }
        };

        match check_source(&input) {
            Ok(()) => {
                println!("OK {path}");
            }
            Err(err) => {
                println!("ERR {path}: {err}");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        std::process::exit(1);
    }
}
