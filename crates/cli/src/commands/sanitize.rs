//! `lorekeep sanitize`: Show what the injection filter does to a text.

use lorekeep_security::Sanitizer;

pub fn run(text: &str, as_context: bool) {
    let sanitizer = Sanitizer::new();
    if !sanitizer.is_operational() {
        println!("Sanitizer patterns failed to compile, running hardened");
    }

    if as_context {
        println!("{}", sanitizer.sanitize_context_injection(text, "cli"));
        return;
    }

    let (cleaned, warnings) = sanitizer.sanitize_user_input(text);
    println!("{cleaned}");
    if warnings.is_empty() {
        println!("\nNo injection patterns found.");
    } else {
        println!("\n{} pattern(s) neutralized:", warnings.len());
        for warning in &warnings {
            println!("  - {warning}");
        }
    }
}
