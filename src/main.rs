use std::io::{self, Write};

fn main() {
    println!("bregex REPL");
    println!("Type an empty pattern to exit.");

    loop {
        print!("regex> ");
        io::stdout().flush().unwrap();
        let mut pattern = String::new();
        if io::stdin().read_line(&mut pattern).is_err() {
            println!("Error reading pattern.");
            continue;
        }
        let pattern = pattern.trim();
        if pattern.is_empty() {
            break;
        }

        let regex = match bregex::Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                println!("Error: {}", e);
                continue;
            }
        };

        let mut context = bregex::Context::new();

        loop {
            println!("Type exit to go back to the regex prompt.");
            print!("input> ");
            io::stdout().flush().unwrap();
            let mut input = String::new();
            if io::stdin().read_line(&mut input).is_err() {
                println!("Error reading input.");
                continue;
            }
            let input = input.trim();
            if input == "exit" {
                break;
            }
            match regex.captures(&mut context, input.as_bytes()) {
                Some(caps) => {
                    println!(
                        "Matched: {}",
                        caps.group0().as_bytes().escape_ascii()
                    );
                    for i in 1..caps.group_len() {
                        match caps.get(i) {
                            Some(group) => {
                                println!("  group {}: {}", i, group.as_bytes().escape_ascii())
                            }
                            None => println!("  group {}: <unset>", i),
                        }
                    }
                }
                None => println!("No match."),
            }
        }
    }
}
