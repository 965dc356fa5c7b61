mod wrap_command;
